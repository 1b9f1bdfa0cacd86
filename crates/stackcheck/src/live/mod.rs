//! Live state collection
//!
//! After deployment the template's outputs tell us which physical resource each logical id became.
//! [LiveStateCollector] looks those up through a read-only [ProviderClient] and fetches the
//! current configuration of every bound resource, in parallel and with retries. A resource that
//! cannot be fetched is recorded as a per-resource error; it never aborts the collection.
mod retry;
mod static_provider;

pub use retry::RetryPolicy;
pub use static_provider::{StateError, StaticProvider};

use crate::expression::Expression;
use crate::resolver::ResolvedTemplate;
use crate::template::Template;
use crate::value::Value;
use indexmap::IndexMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Logical resource exposed through a stack output
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Binding {
    pub resource: String,
    pub resource_type: String,
    pub output: String,
    pub physical_id: String,
}

/// Provider-side configuration of one physical resource
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LiveResourceSnapshot {
    pub resource: String,
    pub physical_id: String,
    pub properties: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("throttled by provider")]
    Throttled,
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("abandoned at the run deadline")]
    Abandoned,
}

impl FetchError {
    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Throttled | FetchError::Transient(_))
    }
}

/// Read-only view of a deployment target
#[async_trait::async_trait]
pub trait ProviderClient: Send + Sync {
    /// Output name to physical id for a deployed environment
    async fn stack_outputs(&self, environment: &str) -> Result<IndexMap<String, String>, FetchError>;

    /// Current configuration of a bound resource
    async fn describe(&self, environment: &str, binding: &Binding) -> Result<Value, FetchError>;
}

/// Fetch error of one resource
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FetchFailure {
    pub resource: String,
    #[serde(serialize_with = "crate::util::serialize_display")]
    pub error: FetchError,
    pub attempts: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveCollection {
    pub environment: String,
    /// Every resource bound by an output, in template order
    pub bindings: Vec<Binding>,
    pub snapshots: IndexMap<String, LiveResourceSnapshot>,
    pub errors: IndexMap<String, FetchFailure>,
    /// The deadline passed before every fetch finished
    pub incomplete: bool,
}

impl LiveCollection {
    pub fn physical_id(&self, resource: &str) -> Option<&str> {
        self.bindings
            .iter()
            .find(|binding| binding.resource == resource)
            .map(|binding| binding.physical_id.as_str())
    }
}

/// Resource referenced by each active output, first output wins
///
/// Only `Ref` and `GetAtt` outputs bind a resource.
pub fn output_bindings(template: &Template, resolved: &ResolvedTemplate) -> Vec<(String, String)> {
    let mut bindings: IndexMap<String, String> = IndexMap::new();
    for (name, output) in &template.outputs {
        if resolved
            .outputs
            .get(name)
            .is_some_and(|output| output.active == Some(false))
        {
            continue;
        }
        let target = match output.value.as_expression() {
            Some(Expression::Reference(target)) | Some(Expression::Attribute { target, .. }) => target,
            _ => continue,
        };
        if template.get(target).is_some() && !bindings.contains_key(target) {
            bindings.insert(target.clone(), name.clone());
        }
    }
    bindings.into_iter().collect()
}

pub struct LiveStateCollector {
    provider: Arc<dyn ProviderClient>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl LiveStateCollector {
    pub fn new(provider: Arc<dyn ProviderClient>) -> Self {
        Self {
            provider,
            retry: RetryPolicy::default(),
            concurrency: 8,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Fetches every output-bound resource of `environment`
    ///
    /// Work still running at `deadline` is aborted; what was collected so far is returned with
    /// [LiveCollection::incomplete] set.
    #[tracing::instrument(skip(self, template, resolved, deadline))]
    pub async fn collect(
        &self,
        template: &Template,
        resolved: &ResolvedTemplate,
        environment: &str,
        deadline: Option<Instant>,
    ) -> LiveCollection {
        let mut collection = LiveCollection {
            environment: environment.to_string(),
            ..Default::default()
        };
        let wanted = output_bindings(template, resolved);
        if wanted.is_empty() {
            tracing::info!("no output binds a resource, nothing to collect");
            return collection;
        }

        let outputs = {
            let provider = &self.provider;
            let lookup = self.retry.run(move || provider.stack_outputs(environment));
            match until(deadline, lookup).await {
                None => {
                    tracing::warn!("deadline passed while reading stack outputs");
                    collection.incomplete = true;
                    for (resource, _) in wanted {
                        collection.errors.insert(
                            resource.clone(),
                            FetchFailure {
                                resource,
                                error: FetchError::Abandoned,
                                attempts: 0,
                            },
                        );
                    }
                    return collection;
                }
                Some((Err(error), attempts)) => {
                    tracing::warn!(%error, "unable to read stack outputs");
                    for (resource, _) in wanted {
                        collection.errors.insert(
                            resource.clone(),
                            FetchFailure {
                                resource,
                                error: error.clone(),
                                attempts,
                            },
                        );
                    }
                    return collection;
                }
                Some((Ok(outputs), _)) => outputs,
            }
        };

        for (resource, output) in wanted {
            match outputs.get(&output) {
                Some(physical_id) => collection.bindings.push(Binding {
                    resource_type: template
                        .get(&resource)
                        .map(|node| node.resource_type.clone())
                        .unwrap_or_default(),
                    resource,
                    output,
                    physical_id: physical_id.clone(),
                }),
                None => {
                    tracing::debug!(%resource, %output, "output not present in the deployed stack");
                    collection.errors.insert(
                        resource.clone(),
                        FetchFailure {
                            resource,
                            error: FetchError::NotFound(format!("stack output `{output}`")),
                            attempts: 1,
                        },
                    );
                }
            }
        }

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for binding in collection.bindings.clone() {
            let provider = Arc::clone(&self.provider);
            let permits = Arc::clone(&permits);
            let retry = self.retry.clone();
            let environment = environment.to_string();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (binding, Err(FetchError::Abandoned), 0);
                };
                let (result, attempts) = retry
                    .run(|| provider.describe(&environment, &binding))
                    .await;
                (binding, result, attempts)
            });
        }

        let mut fetched = IndexMap::new();
        loop {
            match until(deadline, tasks.join_next()).await {
                None => {
                    tracing::warn!(pending = tasks.len(), "deadline passed, abandoning live fetches");
                    tasks.abort_all();
                    collection.incomplete = true;
                    break;
                }
                Some(None) => break,
                Some(Some(Err(error))) => {
                    tracing::warn!(%error, "live fetch task failed");
                    collection.incomplete = true;
                }
                Some(Some(Ok((binding, result, attempts)))) => {
                    fetched.insert(binding.resource.clone(), (binding, result, attempts));
                }
            }
        }

        for binding in &collection.bindings {
            let resource = binding.resource.clone();
            match fetched.shift_remove(&binding.resource) {
                Some((binding, Ok(properties), _)) => {
                    collection.snapshots.insert(
                        resource.clone(),
                        LiveResourceSnapshot {
                            resource,
                            physical_id: binding.physical_id,
                            properties,
                        },
                    );
                }
                Some((_, Err(error), attempts)) => {
                    tracing::debug!(%resource, %error, attempts, "live fetch failed");
                    collection.errors.insert(
                        resource.clone(),
                        FetchFailure {
                            resource,
                            error,
                            attempts,
                        },
                    );
                }
                None => {
                    collection.errors.insert(
                        resource.clone(),
                        FetchFailure {
                            resource,
                            error: FetchError::Abandoned,
                            attempts: 0,
                        },
                    );
                }
            }
        }

        collection
            .errors
            .sort_by(|a, _, b, _| template.index_of(a).cmp(&template.index_of(b)));

        tracing::info!(
            snapshots = collection.snapshots.len(),
            errors = collection.errors.len(),
            incomplete = collection.incomplete,
            "live state collected"
        );
        collection
    }
}

/// Awaits `future`, or gives up at `deadline`
async fn until<F: Future>(deadline: Option<Instant>, future: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::RuleConfig;
    use crate::context::RunContext;
    use crate::template;
    use pretty_assertions::assert_eq;

    #[test]
    fn bindings_come_from_resource_outputs() {
        let template = template!(
            r#"
Conditions:
  Never: !Equals [a, b]
Resources:
  Bucket:
    Type: AWS::S3::Bucket
  Queue:
    Type: AWS::SQS::Queue
Outputs:
  BucketName:
    Value: !Ref Bucket
  BucketArn:
    Value: !GetAtt Bucket.Arn
  QueueUrl:
    Condition: Never
    Value: !Ref Queue
  Region:
    Value: !Ref AWS::Region
"#
        );
        let resolved =
            ResolvedTemplate::resolve(&template, &RunContext::default(), &RuleConfig::builtin())
                .unwrap();

        assert_eq!(
            output_bindings(&template, &resolved),
            vec![("Bucket".to_string(), "BucketName".to_string())]
        );
    }

    #[test]
    fn only_throttling_is_transient() {
        assert!(FetchError::Throttled.is_transient());
        assert!(FetchError::Transient("reset".into()).is_transient());
        assert!(!FetchError::NotFound("x".into()).is_transient());
        assert!(!FetchError::PermissionDenied("x".into()).is_transient());
        assert!(!FetchError::Abandoned.is_transient());
    }
}
