//! One validation run
//!
//! `Loading → Resolving → GraphBuilt → RulesEvaluated → (LiveCollected → DriftCompared) → Reported`
//!
//! A structural error ends the run in `Failed` with nothing downstream reported. The live stages
//! only run when the context names a target environment and a provider is supplied.
use crate::config::{ConfigError, RuleConfig};
use crate::context::RunContext;
use crate::drift;
use crate::graph::DependencyGraph;
use crate::live::{LiveStateCollector, ProviderClient, RetryPolicy};
use crate::report::{Report, ReportBuilder, RunStage};
use crate::resolver::{ResolvedTemplate, Resolver, DEFAULT_DEPTH_LIMIT};
use crate::rules::{Evaluation, RuleEngine, RuleInput};
use crate::template::{SourceFormat, Template};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Run-level deadline for the live path
    pub timeout: Option<Duration>,
    /// Include stage durations in the report
    pub record_timings: bool,
    /// Rule evaluation threads; defaults to the available parallelism
    pub workers: Option<usize>,
    pub retry: RetryPolicy,
    /// Live fetches in flight at once
    pub concurrency: usize,
    /// Longest chain of references the resolver follows
    pub depth_limit: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(120)),
            record_timings: true,
            workers: None,
            retry: RetryPolicy::default(),
            concurrency: 8,
            depth_limit: DEFAULT_DEPTH_LIMIT,
        }
    }
}

/// Products of the static stages, shared read-only by the live path
pub struct Analysis {
    pub template: Template,
    pub resolved: ResolvedTemplate,
    pub graph: DependencyGraph,
    pub evaluation: Evaluation,
}

enum Stages {
    Done(Box<Analysis>, ReportBuilder),
    Failed(Report),
}

pub struct Pipeline {
    config: RuleConfig,
    engine: RuleEngine,
    options: RunOptions,
}

impl Pipeline {
    pub fn new(config: RuleConfig) -> Self {
        Self {
            config,
            engine: RuleEngine::builtin(),
            options: RunOptions::default(),
        }
    }

    pub fn with_engine(mut self, engine: RuleEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        if let Some(workers) = options.workers {
            self.engine = self.engine.with_workers(workers);
        }
        self.options = options;
        self
    }

    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    /// Static-only run
    ///
    /// Errors are problems of the run setup (an environment class the rule configuration does not
    /// know), never findings about the template.
    pub fn run_static(
        &self,
        source: &str,
        format: SourceFormat,
        context: &RunContext,
    ) -> Result<Report, ConfigError> {
        match self.analyse(source, format, context)? {
            Stages::Failed(report) => Ok(report),
            Stages::Done(analysis, mut builder) => {
                builder.skipped(RunStage::LiveCollected);
                builder.skipped(RunStage::DriftCompared);
                Ok(builder.finish(analysis.evaluation.violations, vec![]))
            }
        }
    }

    /// Full run, comparing against `context.environment_id` through `provider`
    ///
    /// Falls back to a static-only report without an environment id or provider.
    pub async fn run(
        &self,
        source: &str,
        format: SourceFormat,
        context: &RunContext,
        provider: Option<Arc<dyn ProviderClient>>,
    ) -> Result<Report, ConfigError> {
        let deadline = self
            .options
            .timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        let (Some(environment), Some(provider)) = (context.environment_id.as_deref(), provider) else {
            return self.run_static(source, format, context);
        };

        let (analysis, mut builder) = match self.analyse(source, format, context)? {
            Stages::Failed(report) => return Ok(report),
            Stages::Done(analysis, builder) => (analysis, builder),
        };
        let Analysis {
            template,
            resolved,
            evaluation,
            ..
        } = *analysis;

        let started = Instant::now();
        let collection = LiveStateCollector::new(provider)
            .with_retry(self.options.retry.clone())
            .with_concurrency(self.options.concurrency)
            .collect(&template, &resolved, environment, deadline)
            .await;
        builder.collected(&collection, started);

        let started = Instant::now();
        let drift = drift::compare(
            &template,
            &resolved,
            &evaluation.assertions,
            &self.config,
            &collection,
        );
        builder.completed(RunStage::DriftCompared, started);

        Ok(builder.finish(evaluation.violations, drift))
    }

    #[tracing::instrument(skip_all)]
    fn analyse(
        &self,
        source: &str,
        format: SourceFormat,
        context: &RunContext,
    ) -> Result<Stages, ConfigError> {
        let mut builder = ReportBuilder::new(self.options.record_timings);

        let started = Instant::now();
        let template = match Template::parse(source, format) {
            Ok(template) => template,
            Err(error) => return Ok(Stages::Failed(builder.fail(RunStage::Loading, started, &error.into()))),
        };
        builder.completed(RunStage::Loading, started);
        tracing::info!(resources = template.len(), "template loaded");

        let started = Instant::now();
        let resolved = match Resolver::new(&template, context, &self.config)
            .with_depth_limit(self.options.depth_limit)
            .resolve_all()
        {
            Ok(resolved) => resolved,
            Err(error) => return Ok(Stages::Failed(builder.fail(RunStage::Resolving, started, &error))),
        };
        builder.completed(RunStage::Resolving, started);

        let started = Instant::now();
        let graph = match DependencyGraph::build(&template) {
            Ok(graph) => graph,
            Err(error) => return Ok(Stages::Failed(builder.fail(RunStage::GraphBuilt, started, &error))),
        };
        builder.completed(RunStage::GraphBuilt, started);

        let started = Instant::now();
        let evaluation = self.engine.evaluate(&RuleInput {
            template: &template,
            resolved: &resolved,
            graph: &graph,
            config: &self.config,
            context,
        })?;
        builder.completed(RunStage::RulesEvaluated, started);

        Ok(Stages::Done(
            Box::new(Analysis {
                template,
                resolved,
                graph,
                evaluation,
            }),
            builder,
        ))
    }
}
