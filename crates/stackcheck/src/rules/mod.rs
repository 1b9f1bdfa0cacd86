//! Rule engine
//!
//! A [Rule] is a side-effect free check of one resource against the resolved template. The
//! engine fans resources out to a fixed pool of scoped worker threads over a job channel; each
//! worker sends its findings back on a single result channel, which is the only aggregation
//! point. Reported order does not depend on scheduling: [Violation]s are sorted by severity
//! (highest first), then resource id, then rule name.
//!
//! Besides violations, rules record [Assertion]s: the fields they made a requirement about.
//! These are re-checked against live state by [crate::drift].
mod dependency;
mod encryption;
mod lifecycle;
mod naming;
mod network;
mod tagging;

pub use dependency::RedundantDependencyRule;
pub use encryption::EncryptionAtRest;
pub use lifecycle::DeletionPolicy;
pub use naming::NamingConvention;
pub use network::NetworkExposure;
pub use tagging::RequiredTags;

use crate::config::{ConfigError, ResourceTypeSpec, RuleConfig};
use crate::context::RunContext;
use crate::graph::DependencyGraph;
use crate::resolver::{ResolvedNode, ResolvedTemplate};
use crate::template::{NodeIndex, ResourceNode, Template};
use crate::util::FieldPath;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Violation {
    pub rule: String,
    pub resource: String,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Violation {
    /// Report order: severity desc, resource, rule
    fn sort_key(&self) -> impl Ord + '_ {
        (
            std::cmp::Reverse(self.severity),
            &self.resource,
            &self.rule,
            &self.path,
            &self.message,
        )
    }
}

/// Requirement a rule placed on a field of a resource
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Assertion {
    pub rule: String,
    pub resource: String,
    pub path: FieldPath,
    pub severity: Severity,
}

/// Everything a rule may look at, shared read-only by all workers
pub struct RuleInput<'a> {
    pub template: &'a Template,
    pub resolved: &'a ResolvedTemplate,
    pub graph: &'a DependencyGraph,
    pub config: &'a RuleConfig,
    pub context: &'a RunContext,
}

impl<'a> RuleInput<'a> {
    pub fn node(&self, index: NodeIndex) -> &'a ResourceNode {
        self.template.resource(index)
    }

    pub fn resolved(&self, index: NodeIndex) -> &'a ResolvedNode {
        self.resolved.node(index)
    }

    /// Catalog entry for the resource's type
    pub fn spec(&self, index: NodeIndex) -> Option<&'a ResourceTypeSpec> {
        self.config.resource_type(&self.node(index).resource_type)
    }

    pub fn environment_class(&self) -> &'a str {
        if self.context.environment_class.is_empty() {
            &self.config.default_environment_class
        } else {
            &self.context.environment_class
        }
    }
}

pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    /// Message template; `{resource}` and `{detail}` are substituted
    fn message(&self) -> &str;

    fn check(&self, input: &RuleInput<'_>, index: NodeIndex, findings: &mut Findings);
}

/// Collects what one rule found on one resource
pub struct Findings<'r> {
    rule: &'r str,
    message: &'r str,
    resource: &'r str,
    violations: Vec<Violation>,
    assertions: Vec<Assertion>,
}

impl<'r> Findings<'r> {
    fn new(rule: &'r dyn Rule, resource: &'r str) -> Self {
        Self {
            rule: rule.name(),
            message: rule.message(),
            resource,
            violations: vec![],
            assertions: vec![],
        }
    }

    pub fn violation(&mut self, severity: Severity, detail: impl std::fmt::Display, path: Option<&FieldPath>) {
        let message = self
            .message
            .replace("{resource}", self.resource)
            .replace("{detail}", &detail.to_string());

        self.violations.push(Violation {
            rule: self.rule.to_string(),
            resource: self.resource.to_string(),
            severity,
            message,
            path: path.map(FieldPath::to_string),
        });
    }

    pub fn assert(&mut self, path: FieldPath, severity: Severity) {
        self.assertions.push(Assertion {
            rule: self.rule.to_string(),
            resource: self.resource.to_string(),
            path,
            severity,
        });
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub violations: Vec<Violation>,
    pub assertions: Vec<Assertion>,
}

pub struct RuleEngine {
    rules: Vec<Box<dyn Rule>>,
    workers: usize,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RuleEngine {
    pub fn empty() -> Self {
        Self {
            rules: vec![],
            workers: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
        }
    }

    /// Engine with every built-in rule family
    pub fn builtin() -> Self {
        Self::empty()
            .with_rule(NamingConvention)
            .with_rule(DeletionPolicy)
            .with_rule(NetworkExposure)
            .with_rule(EncryptionAtRest)
            .with_rule(RequiredTags)
            .with_rule(RedundantDependencyRule)
    }

    pub fn with_rule(mut self, rule: impl Rule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.name())
    }

    #[tracing::instrument(skip_all, fields(rules = self.rules.len()))]
    pub fn evaluate(&self, input: &RuleInput<'_>) -> Result<Evaluation, ConfigError> {
        input.config.allowed_policies(input.environment_class())?;

        let rules = self
            .rules
            .iter()
            .map(|rule| &**rule)
            .filter(|rule| {
                let enabled = input.config.is_enabled(rule.name());
                if !enabled {
                    tracing::debug!(rule = rule.name(), "rule disabled");
                }
                enabled
            })
            .collect::<Vec<&dyn Rule>>();

        let (job_sender, jobs) = crossbeam_channel::unbounded::<NodeIndex>();
        let (result_sender, results) = crossbeam_channel::unbounded::<Evaluation>();

        for index in 0..input.template.len() {
            if input.resolved(index).is_active() {
                // the receiver lives until the end of this function
                let _ = job_sender.send(index);
            } else {
                tracing::debug!(resource = %input.node(index).id, "condition is false, skipping rules");
            }
        }
        drop(job_sender);

        let workers = self.workers.min(input.template.len()).max(1);
        let mut evaluation = Evaluation::default();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let jobs = jobs.clone();
                let result_sender = result_sender.clone();
                let rules = &rules;
                scope.spawn(move || {
                    for index in jobs.iter() {
                        let resource = &input.node(index).id;
                        let mut found = Evaluation::default();
                        for rule in rules {
                            let mut findings = Findings::new(*rule, resource);
                            rule.check(input, index, &mut findings);
                            found.violations.extend(findings.violations);
                            found.assertions.extend(findings.assertions);
                        }
                        if result_sender.send(found).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_sender);

            for found in results.iter() {
                evaluation.violations.extend(found.violations);
                evaluation.assertions.extend(found.assertions);
            }
        });

        evaluation
            .violations
            .sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        evaluation.assertions.sort_by(|a, b| {
            (&a.resource, &a.path, &a.rule).cmp(&(&b.resource, &b.path, &b.rule))
        });

        tracing::info!(
            violations = evaluation.violations.len(),
            assertions = evaluation.assertions.len(),
            "rules evaluated"
        );
        Ok(evaluation)
    }
}

/// Whether a resolved value counts as "set": present, not null, not `false`, not empty
pub(crate) fn is_set(value: &crate::resolver::Resolved) -> bool {
    use crate::resolver::Resolved;
    use crate::value::Value;

    match value {
        Resolved::Literal(Value::Null) | Resolved::Literal(Value::Boolean(false)) => false,
        Resolved::Literal(Value::String(s)) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
        _ => true,
    }
}

/// Tags of a resource as key/value pairs, whatever the declared shape
///
/// Accepts the list form (`[{Key, Value}]`) and the map form (`{Key: Value}`).
pub(crate) fn tags(node: &ResolvedNode) -> Vec<(String, crate::resolver::Resolved)> {
    use crate::resolver::Resolved;
    use crate::value::Value;

    let Some(tags) = node.properties.get("Tags") else {
        return vec![];
    };

    let entries = match tags {
        Resolved::Literal(Value::Array(items)) => {
            items.iter().cloned().map(Resolved::Literal).collect::<Vec<_>>()
        }
        Resolved::List(items) => items.clone(),
        Resolved::Literal(Value::Object(map)) => {
            return map
                .iter()
                .map(|(key, value)| (key.clone(), Resolved::Literal(value.clone())))
                .collect()
        }
        Resolved::Map(map) => {
            return map
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        }
        _ => return vec![],
    };

    let key_path = FieldPath::root("Key");
    let value_path = FieldPath::root("Value");
    entries
        .iter()
        .filter_map(|entry| {
            let key = entry.get(&key_path)?.into_literal()?.to_text()?;
            let value = entry.get(&value_path)?;
            Some((key, value))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::template;
    use pretty_assertions::assert_eq;

    /// Resolve, build the graph and evaluate with the built-in catalog
    pub(crate) fn evaluate(template: &Template, context: &RunContext) -> Evaluation {
        evaluate_with(template, context, &RuleConfig::builtin())
    }

    pub(crate) fn evaluate_with(template: &Template, context: &RunContext, config: &RuleConfig) -> Evaluation {
        let resolved = ResolvedTemplate::resolve(template, context, config).unwrap();
        let graph = DependencyGraph::build(template).unwrap();
        let input = RuleInput {
            template,
            resolved: &resolved,
            graph: &graph,
            config,
            context,
        };
        RuleEngine::builtin().with_workers(4).evaluate(&input).unwrap()
    }

    pub(crate) fn ephemeral() -> RunContext {
        RunContext::new("ephemeral".into()).with_token("qa17")
    }

    #[test]
    fn builtin_rule_names() {
        assert_eq!(
            RuleEngine::builtin().rule_names().collect::<Vec<_>>(),
            vec![
                "naming-convention",
                "deletion-policy",
                "network-exposure",
                "encryption-at-rest",
                "required-tags",
                "redundant-dependency",
            ]
        );
        assert_eq!(RuleEngine::empty().rule_names().count(), 0);
    }

    #[test]
    fn violations_are_ordered() {
        let template = template!(
            r#"
Resources:
  Zeta:
    Type: AWS::SQS::Queue
    Properties:
      QueueName: zeta
  Alpha:
    Type: AWS::RDS::DBInstance
    Properties:
      DBInstanceIdentifier: alpha
"#
        );
        let evaluation = evaluate(&template, &ephemeral());
        let order = evaluation
            .violations
            .iter()
            .map(|v| (v.severity, v.resource.as_str(), v.rule.as_str()))
            .collect::<Vec<_>>();

        assert_eq!(
            order,
            vec![
                (Severity::Critical, "Alpha", "deletion-policy"),
                (Severity::Critical, "Zeta", "deletion-policy"),
                (Severity::High, "Alpha", "naming-convention"),
                (Severity::High, "Zeta", "naming-convention"),
                (Severity::Medium, "Alpha", "encryption-at-rest"),
                (Severity::Medium, "Zeta", "encryption-at-rest"),
            ]
        );
    }

    #[test]
    fn unknown_environment_class() {
        let template = template!("Resources:\n  Queue:\n    Type: AWS::SQS::Queue\n");
        let context = RunContext::new("moon".into());
        let config = RuleConfig::builtin();
        let resolved = ResolvedTemplate::resolve(&template, &context, &config).unwrap();
        let graph = DependencyGraph::build(&template).unwrap();
        let input = RuleInput {
            template: &template,
            resolved: &resolved,
            graph: &graph,
            config: &config,
            context: &context,
        };

        assert!(matches!(
            RuleEngine::builtin().evaluate(&input),
            Err(ConfigError::UnknownEnvironmentClass(class)) if class == "moon"
        ));
    }

    #[test]
    fn disabled_rules_and_inactive_resources_are_skipped() {
        let template = template!(
            r#"
Conditions:
  Never: !Equals [a, b]
Resources:
  Replica:
    Type: AWS::RDS::DBInstance
    Condition: Never
  Queue:
    Type: AWS::SQS::Queue
    DeletionPolicy: Delete
    Properties:
      QueueName: jobs-qa17
"#
        );
        let mut config = RuleConfig::builtin();
        config.disabled_rules.push("encryption-at-rest".into());

        let evaluation = evaluate_with(&template, &ephemeral(), &config);
        assert_eq!(evaluation.violations, vec![]);
    }

    struct NoQueues;

    impl Rule for NoQueues {
        fn name(&self) -> &str {
            "no-queues"
        }

        fn message(&self) -> &str {
            "{resource}: {detail}"
        }

        fn check(&self, input: &RuleInput<'_>, index: NodeIndex, findings: &mut Findings) {
            if input.node(index).resource_type == "AWS::SQS::Queue" {
                findings.violation(Severity::Low, "queues are not allowed", None);
            }
        }
    }

    #[test]
    fn custom_rule() {
        let template = template!("Resources:\n  Queue:\n    Type: AWS::SQS::Queue\n");
        let context = ephemeral();
        let config = RuleConfig::builtin();
        let resolved = ResolvedTemplate::resolve(&template, &context, &config).unwrap();
        let graph = DependencyGraph::build(&template).unwrap();
        let input = RuleInput {
            template: &template,
            resolved: &resolved,
            graph: &graph,
            config: &config,
            context: &context,
        };

        let evaluation = RuleEngine::empty().with_rule(NoQueues).evaluate(&input).unwrap();
        assert_eq!(
            evaluation.violations,
            vec![Violation {
                rule: "no-queues".into(),
                resource: "Queue".into(),
                severity: Severity::Low,
                message: "Queue: queues are not allowed".into(),
                path: None,
            }]
        );
    }
}
