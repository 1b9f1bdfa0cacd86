use super::{Binding, FetchError, ProviderClient};
use crate::value::Value;
use indexmap::IndexMap;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Provider backed by a recorded live-state document
///
/// ```yaml
/// environment: qa17
/// outputs:
///   DataBucketName: qa17-data
/// resources:
///   qa17-data:
///     BucketName: qa17-data
///     VersioningConfiguration: { Status: Enabled }
/// failures:            # optional, consumed one per describe call
///   qa17-data: [throttled, throttled]
/// ```
#[derive(Debug, Default)]
pub struct StaticProvider {
    environment: String,
    outputs: IndexMap<String, String>,
    resources: IndexMap<String, Value>,
    failures: Mutex<HashMap<String, VecDeque<FetchError>>>,
    delays: HashMap<String, Duration>,
    calls: Mutex<HashMap<String, usize>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("IO error")]
    IoError(#[from] std::io::Error),
    #[error("Unable to parse live state document")]
    ParseFailed(#[from] serde_yaml::Error),
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct StateDocument {
    environment: String,
    #[serde(default)]
    outputs: IndexMap<String, String>,
    #[serde(default)]
    resources: IndexMap<String, serde_json::Value>,
    #[serde(default)]
    failures: IndexMap<String, Vec<ScriptedFailure>>,
}

#[derive(serde::Deserialize, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
enum ScriptedFailure {
    Throttled,
    Transient,
    NotFound,
    PermissionDenied,
    Provider,
}

impl ScriptedFailure {
    fn into_error(self, physical_id: &str) -> FetchError {
        match self {
            ScriptedFailure::Throttled => FetchError::Throttled,
            ScriptedFailure::Transient => FetchError::Transient(format!("scripted failure for `{physical_id}`")),
            ScriptedFailure::NotFound => FetchError::NotFound(format!("resource `{physical_id}`")),
            ScriptedFailure::PermissionDenied => FetchError::PermissionDenied(format!("describe `{physical_id}`")),
            ScriptedFailure::Provider => FetchError::Provider(format!("scripted failure for `{physical_id}`")),
        }
    }
}

impl StaticProvider {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, name: impl Into<String>, physical_id: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), physical_id.into());
        self
    }

    pub fn with_resource(mut self, physical_id: impl Into<String>, properties: impl Into<Value>) -> Self {
        self.resources.insert(physical_id.into(), properties.into());
        self
    }

    /// Errors returned by the next describe calls for `physical_id`, in order
    pub fn with_failures(
        self,
        physical_id: impl Into<String>,
        errors: impl IntoIterator<Item = FetchError>,
    ) -> Self {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(physical_id.into())
            .or_default()
            .extend(errors);
        self
    }

    /// Latency of every describe call for `physical_id`
    pub fn with_delay(mut self, physical_id: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(physical_id.into(), delay);
        self
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, StateError> {
        let document: StateDocument = serde_yaml::from_str(text)?;

        let mut provider = Self::new(document.environment);
        provider.outputs = document.outputs;
        provider.resources = document
            .resources
            .into_iter()
            .map(|(physical_id, properties)| (physical_id, Value::from(properties)))
            .collect();
        for (physical_id, failures) in document.failures {
            let errors = failures
                .into_iter()
                .map(|failure| failure.into_error(&physical_id))
                .collect::<Vec<_>>();
            provider = provider.with_failures(physical_id, errors);
        }
        Ok(provider)
    }

    /// Reads a JSON or YAML live-state document
    pub fn load_file(path: &Path) -> Result<Self, StateError> {
        tracing::info!(path = %path.display(), "loading live state");
        Self::from_yaml_str(&std::fs::read_to_string(path)?)
    }

    /// Number of describe calls made for `physical_id`
    pub fn calls(&self, physical_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(physical_id)
            .copied()
            .unwrap_or(0)
    }

    fn check_environment(&self, environment: &str) -> Result<(), FetchError> {
        if environment == self.environment {
            Ok(())
        } else {
            Err(FetchError::NotFound(format!("environment `{environment}`")))
        }
    }
}

#[async_trait::async_trait]
impl ProviderClient for StaticProvider {
    async fn stack_outputs(&self, environment: &str) -> Result<IndexMap<String, String>, FetchError> {
        self.check_environment(environment)?;
        Ok(self.outputs.clone())
    }

    async fn describe(&self, environment: &str, binding: &Binding) -> Result<Value, FetchError> {
        self.check_environment(environment)?;
        let physical_id = binding.physical_id.as_str();

        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(physical_id.to_string())
            .or_default() += 1;

        if let Some(delay) = self.delays.get(physical_id).copied() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(physical_id)
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }

        self.resources
            .get(physical_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(format!("resource `{physical_id}`")))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn binding(physical_id: &str) -> Binding {
        Binding {
            resource: "Queue".into(),
            resource_type: "AWS::SQS::Queue".into(),
            output: "QueueUrl".into(),
            physical_id: physical_id.into(),
        }
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let provider = StaticProvider::from_yaml_str(
            r#"
environment: qa17
outputs:
  QueueUrl: qa17-jobs
resources:
  qa17-jobs:
    VisibilityTimeout: 30
failures:
  qa17-jobs: [throttled, permission-denied]
"#,
        )
        .unwrap();
        let queue = binding("qa17-jobs");

        assert_eq!(
            provider.stack_outputs("qa17").await.unwrap().get("QueueUrl").map(String::as_str),
            Some("qa17-jobs")
        );
        assert_eq!(provider.describe("qa17", &queue).await, Err(FetchError::Throttled));
        assert!(matches!(
            provider.describe("qa17", &queue).await,
            Err(FetchError::PermissionDenied(_))
        ));
        assert_eq!(
            provider
                .describe("qa17", &queue)
                .await
                .unwrap()
                .get(&"VisibilityTimeout".parse().unwrap()),
            Some(&Value::Integer(30))
        );
        assert_eq!(provider.calls("qa17-jobs"), 3);
    }

    #[tokio::test]
    async fn unknown_environment_and_resource() {
        let provider = StaticProvider::new("qa17");

        assert_eq!(
            provider.stack_outputs("prod").await,
            Err(FetchError::NotFound("environment `prod`".into()))
        );
        assert_eq!(
            provider.describe("qa17", &binding("missing")).await,
            Err(FetchError::NotFound("resource `missing`".into()))
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(StaticProvider::from_yaml_str("environment: qa17\nresource: {}\n").is_err());
    }
}
