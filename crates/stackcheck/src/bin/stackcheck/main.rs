mod cli;

use anyhow::Context;
use indexmap::IndexMap;
use stackcheck::config::RuleConfig;
use stackcheck::context::RunContext;
use stackcheck::graph::DependencyGraph;
use stackcheck::live::{ProviderClient, StaticProvider};
use stackcheck::pipeline::{Pipeline, RunOptions};
use stackcheck::report::TOOL_ERROR_EXIT_CODE;
use stackcheck::resolver::{Resolved, ResolvedNode, ResolvedOutput, ResolvedTemplate};
use stackcheck::rules::RuleEngine;
use stackcheck::template::{SourceFormat, Template};
use std::sync::Arc;
use std::time::Duration;

fn main() {
    use clap::Parser;
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("STACKCHECK_LOG"))
        .with_writer(std::io::stderr)
        .init();

    for new_path in cli.directory.iter() {
        match new_path.canonicalize() {
            Err(e) => {
                eprintln!(
                    "Failed to resolve path for -C/--directory {}\n{}",
                    new_path.display(),
                    e
                );
                std::process::exit(TOOL_ERROR_EXIT_CODE);
            }
            Ok(cwd) => {
                if let Err(err) = std::env::set_current_dir(&cwd) {
                    eprintln!("Failed to set work directory to {}\n{}", cwd.display(), err,);
                    std::process::exit(TOOL_ERROR_EXIT_CODE);
                }

                tracing::info!(directory=%cwd.display(), "Changed working directory");
            }
        }
    }

    let command_result = match cli.command {
        cli::Command::Check(check_cli) => check(check_cli),
        cli::Command::Dev(dev_cli) => dev(dev_cli).map(|()| 0),
    };

    match command_result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            for error in e.chain() {
                eprintln!("{error}")
            }
            std::process::exit(TOOL_ERROR_EXIT_CODE);
        }
    }
}

/// Runs the checks and returns the exit code of the report
pub fn check(cli: cli::CheckCommand) -> anyhow::Result<i32> {
    let (source, format) = load(&cli.input)?;
    let config = rules(cli.rules.as_deref())?;
    let mut context = run_context(&cli.context, &config);

    let pipeline = Pipeline::new(config).with_options(RunOptions {
        timeout: Some(Duration::from_secs(cli.timeout)),
        record_timings: !cli.no_timings,
        workers: cli.workers,
        depth_limit: cli.depth_limit,
        ..Default::default()
    });

    let report = match (cli.environment, &cli.live_state) {
        (Some(environment), Some(live_state)) => {
            let provider: Arc<dyn ProviderClient> = Arc::new(
                StaticProvider::load_file(live_state)
                    .with_context(|| format!("Failed to load live state {}", live_state.display()))?,
            );
            context.environment_id = Some(environment);

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(pipeline.run(&source, format, &context, Some(provider)))?
        }
        _ => pipeline.run_static(&source, format, &context)?,
    };

    output(&cli.output, &report)?;
    Ok(report.exit_code())
}

fn load(input: &cli::InputArgs) -> anyhow::Result<(String, SourceFormat)> {
    let requested = input.input_format.map(|format| match format {
        cli::InputFormat::Json => SourceFormat::Json,
        cli::InputFormat::Yaml => SourceFormat::Yaml,
        cli::InputFormat::Hcl => SourceFormat::Hcl,
    });

    let Some(file_path) = &input.file else {
        let stdin = std::io::read_to_string(std::io::stdin())?;
        let format = requested.unwrap_or_else(|| SourceFormat::sniff(&stdin));
        return Ok((stdin, format));
    };

    tracing::info!(path=%file_path.display(), "loading file");
    let source = std::fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read {}", file_path.display()))?;
    let format = requested
        .or_else(|| SourceFormat::from_path(file_path))
        .unwrap_or_else(|| SourceFormat::sniff(&source));
    Ok((source, format))
}

fn rules(path: Option<&std::path::Path>) -> anyhow::Result<RuleConfig> {
    match path {
        Some(path) => RuleConfig::load_file(path)
            .with_context(|| format!("Failed to load rule configuration {}", path.display())),
        None => Ok(RuleConfig::builtin()),
    }
}

fn run_context(cli: &cli::ContextArgs, config: &RuleConfig) -> RunContext {
    let environment_class = cli
        .environment_class
        .clone()
        .unwrap_or_else(|| config.default_environment_class.clone());

    let mut context = RunContext::new(environment_class);
    context.environment_token = cli.env_token.clone();
    context.region = cli.region.clone();
    context.account_id = cli.account_id.clone();
    context.stack_name = cli.stack_name.clone();
    for (name, value) in &cli.parameters {
        context = context.with_parameter(name, value.as_str());
    }
    context
}

fn output(output: &cli::OutputArgs, value: &impl serde::Serialize) -> anyhow::Result<()> {
    match output.format {
        cli::OutputFormat::Yaml => serde_yaml::to_writer(std::io::stdout(), value)?,
        cli::OutputFormat::Json => {
            serde_json::to_writer_pretty(std::io::stdout(), value)?;
            println!();
        }
    };

    Ok(())
}

#[derive(serde::Serialize)]
struct ResolvedDump<'a> {
    resources: &'a [ResolvedNode],
    conditions: &'a IndexMap<String, Resolved>,
    outputs: &'a IndexMap<String, ResolvedOutput>,
}

/// (stackcheck-)developer utilities
///
/// A quick way to expose internal structures for debugging purposes
pub fn dev(cli: cli::DevCommand) -> anyhow::Result<()> {
    use cli::DevSubCommand;

    let args = match &cli.command {
        DevSubCommand::Template(args) | DevSubCommand::Resolved(args) | DevSubCommand::Graph(args) => {
            args
        }
        DevSubCommand::Rules(args) => {
            let config = rules(args.rules.as_deref())?;
            let engine = RuleEngine::builtin();
            let listing = engine
                .rule_names()
                .map(|name| (name.to_string(), config.is_enabled(name)))
                .collect::<IndexMap<String, bool>>();
            return output(
                &cli::OutputArgs {
                    format: cli::OutputFormat::Yaml,
                },
                &listing,
            );
        }
    };
    let (source, format) = load(&args.input)?;
    let config = rules(args.rules.as_deref())?;
    let context = run_context(&args.context, &config);
    let template = Template::parse(&source, format)?;
    let yaml = cli::OutputArgs {
        format: cli::OutputFormat::Yaml,
    };

    match cli.command {
        DevSubCommand::Template(_) => println!("{template:#?}"),
        DevSubCommand::Resolved(_) => {
            let resolved = ResolvedTemplate::resolve(&template, &context, &config)?;
            output(
                &yaml,
                &ResolvedDump {
                    resources: resolved.nodes(),
                    conditions: &resolved.conditions,
                    outputs: &resolved.outputs,
                },
            )?;
        }
        DevSubCommand::Graph(_) => {
            let graph = DependencyGraph::build(&template)?;
            output(&yaml, &graph)?;
        }
        DevSubCommand::Rules(_) => {}
    }

    Ok(())
}
