//! stackcheck cli interface

use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::Formatter;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Change the work directory
    ///
    /// Can be specified multiple times. Note that all
    /// paths on the way to the final path must exist.
    ///
    /// This is equivalent to running { cd <directory>; stackcheck ... }
    #[clap(short = 'C', long = "directory", global(true))]
    pub directory: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check a template, and optionally a deployed environment
    ///
    /// Reads the template from stdin unless a file is given.
    ///
    /// Exit codes: 0 passed, 1 failed, 2 passed with warnings, 3 tool error
    Check(CheckCommand),

    /// Print debug information for development
    Dev(DevCommand),
}

#[derive(Parser, Debug)]
pub struct CheckCommand {
    #[clap(flatten)]
    pub input: InputArgs,

    #[clap(flatten)]
    pub context: ContextArgs,

    /// Rule configuration replacing the built-in catalog
    #[clap(long = "rules")]
    pub rules: Option<PathBuf>,

    /// Deployed environment to compare against
    ///
    /// Requires --live-state.
    #[clap(long = "environment", requires("live_state"))]
    pub environment: Option<String>,

    /// Recorded live state (JSON or YAML) of the deployed environment
    #[clap(long = "live-state", requires("environment"))]
    pub live_state: Option<PathBuf>,

    /// Run deadline in seconds for live collection
    #[clap(long = "timeout", default_value_t = 120)]
    pub timeout: u64,

    /// Leave stage durations out of the report
    #[clap(long = "no-timings")]
    pub no_timings: bool,

    /// Rule evaluation threads
    #[clap(long = "workers")]
    pub workers: Option<usize>,

    /// Longest chain of references followed while resolving
    #[clap(long = "depth-limit", default_value_t = stackcheck::resolver::DEFAULT_DEPTH_LIMIT)]
    pub depth_limit: usize,

    #[clap(flatten)]
    pub output: OutputArgs,
}

#[derive(Parser, Debug)]
pub struct InputArgs {
    /// Template file; the format follows the extension (.json, .yaml/.yml, .hcl)
    pub file: Option<PathBuf>,

    /// Template format, overriding extension and content sniffing
    #[clap(long = "format")]
    pub input_format: Option<InputFormat>,
}

#[derive(Parser, Debug)]
pub struct ContextArgs {
    /// Token that must appear in resource names, e.g. qa17
    #[clap(short = 't', long = "env-token")]
    pub env_token: Option<String>,

    /// Environment class selecting the deletion-policy allow-list
    ///
    /// Defaults to the rule configuration's default class.
    #[clap(short = 'e', long = "environment-class")]
    pub environment_class: Option<String>,

    #[clap(long = "region")]
    pub region: Option<String>,

    #[clap(long = "account-id")]
    pub account_id: Option<String>,

    #[clap(long = "stack-name")]
    pub stack_name: Option<String>,

    /// Parameter override, e.g. -p Env=qa17
    #[clap(short = 'p', long = "parameter", value_parser = parse_key_value)]
    pub parameters: Vec<(String, String)>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum InputFormat {
    Json,
    Yaml,
    Hcl,
}

#[derive(Parser, Debug)]
pub struct OutputArgs {
    #[arg(short = 'F', long = "output-format", default_value_t)]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Clone, Default, Debug)]
pub enum OutputFormat {
    Json,
    #[default]
    Yaml,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Json => f.write_str("json"),
            OutputFormat::Yaml => f.write_str("yaml"),
        }
    }
}

#[derive(Parser, Debug)]
pub struct DevCommand {
    #[command(subcommand)]
    pub command: DevSubCommand,
}

#[derive(Subcommand, Debug)]
pub enum DevSubCommand {
    /// Parsed template
    Template(DevArgs),
    /// Resolved properties, conditions and outputs
    Resolved(DevArgs),
    /// Dependency graph in topological order
    Graph(DevArgs),
    /// Registered rules and whether the rule configuration enables them
    Rules(RulesArgs),
}

#[derive(Parser, Debug)]
pub struct RulesArgs {
    /// Rule configuration replacing the built-in catalog
    #[clap(long = "rules")]
    pub rules: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct DevArgs {
    #[clap(flatten)]
    pub input: InputArgs,

    #[clap(flatten)]
    pub context: ContextArgs,

    /// Rule configuration replacing the built-in catalog
    #[clap(long = "rules")]
    pub rules: Option<PathBuf>,
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parameters() {
        let cli = Cli::parse_from(["stackcheck", "check", "t.yaml", "-p", "Env=qa17", "-p", "Tags=a=b"]);
        let Command::Check(check) = cli.command else {
            panic!("expected check");
        };
        assert_eq!(
            check.context.parameters,
            vec![("Env".to_string(), "qa17".to_string()), ("Tags".to_string(), "a=b".to_string())]
        );
        assert!(Cli::try_parse_from(["stackcheck", "check", "-p", "novalue"]).is_err());
    }

    #[test]
    fn input_and_output_formats_are_separate() {
        let cli = Cli::parse_from([
            "stackcheck",
            "check",
            "template.txt",
            "--format",
            "hcl",
            "-F",
            "json",
            "--depth-limit",
            "2048",
        ]);
        let Command::Check(check) = cli.command else {
            panic!("expected check");
        };
        assert!(matches!(check.input.input_format, Some(InputFormat::Hcl)));
        assert!(matches!(check.output.format, OutputFormat::Json));
        assert_eq!(check.depth_limit, 2048);

        let cli = Cli::parse_from(["stackcheck", "check", "template.yaml"]);
        let Command::Check(check) = cli.command else {
            panic!("expected check");
        };
        assert!(check.input.input_format.is_none());
        assert!(matches!(check.output.format, OutputFormat::Yaml));
        assert_eq!(check.depth_limit, stackcheck::resolver::DEFAULT_DEPTH_LIMIT);
    }
}
