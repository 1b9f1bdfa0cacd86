//! Live comparison against a scripted provider

use pretty_assertions::assert_eq;
use stackcheck::config::RuleConfig;
use stackcheck::context::RunContext;
use stackcheck::drift::{DriftRecord, DriftStatus};
use stackcheck::live::{FetchError, ProviderClient, RetryPolicy, StaticProvider};
use stackcheck::pipeline::{Pipeline, RunOptions};
use stackcheck::report::{Report, RunStage, RunStatus, StageOutcome};
use stackcheck::rules::Severity;
use stackcheck::template::SourceFormat;
use stackcheck::util::FieldPath;
use stackcheck::value::Value;
use std::sync::Arc;
use std::time::Duration;

const QUEUE_URL: &str = "https://sqs.eu-west-1.amazonaws.com/123456789012/orders-qa17";

const TEMPLATE: &str = r#"
Resources:
  Orders:
    Type: AWS::SQS::Queue
    DeletionPolicy: Delete
    Properties:
      QueueName: orders-qa17
      KmsMasterKeyId: K1
Outputs:
  OrdersQueue:
    Value: !Ref Orders
"#;

fn provider(key: &str) -> StaticProvider {
    StaticProvider::new("qa17")
        .with_output("OrdersQueue", QUEUE_URL)
        .with_resource(
            QUEUE_URL,
            serde_json::json!({
                "QueueName": "orders-qa17",
                "KmsMasterKeyId": key,
                "VisibilityTimeout": 30,
            }),
        )
}

fn options(timeout: Duration) -> RunOptions {
    RunOptions {
        timeout: Some(timeout),
        record_timings: false,
        retry: RetryPolicy {
            max_attempts: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
            jitter: false,
        },
        ..Default::default()
    }
}

async fn run(provider: Arc<StaticProvider>, timeout: Duration) -> Report {
    let context = RunContext::new("ephemeral".into())
        .with_token("qa17")
        .with_environment("qa17");
    let provider: Arc<dyn ProviderClient> = provider;

    Pipeline::new(RuleConfig::builtin())
        .with_options(options(timeout))
        .run(TEMPLATE, SourceFormat::Yaml, &context, Some(provider))
        .await
        .unwrap()
}

fn record<'a>(report: &'a Report, path: &str) -> &'a DriftRecord {
    let path = FieldPath::root(path);
    report
        .drift
        .iter()
        .find(|record| record.resource == "Orders" && record.path == path)
        .unwrap()
}

#[tokio::test]
async fn changed_key_is_drift() {
    let report = run(Arc::new(provider("K2")), Duration::from_secs(10)).await;

    let drifted = report
        .drift
        .iter()
        .filter(|record| record.status == DriftStatus::Drift)
        .collect::<Vec<_>>();
    assert_eq!(drifted.len(), 1);
    assert_eq!(drifted[0].path, FieldPath::root("KmsMasterKeyId"));
    assert_eq!(drifted[0].declared.as_literal(), Some(&Value::from("K1")));
    assert_eq!(drifted[0].observed, Some(Value::from("K2")));
    assert_eq!(drifted[0].rule.as_deref(), Some("encryption-at-rest"));
    assert_eq!(drifted[0].severity, Severity::Medium);

    assert_eq!(record(&report, "QueueName").status, DriftStatus::Match);
    assert!(report.violations.is_empty());
    assert_eq!(report.environment.as_deref(), Some("qa17"));
    assert_eq!(report.status, RunStatus::PassedWithWarnings);
    assert_eq!(report.exit_code(), 2);
}

#[tokio::test]
async fn unchanged_environment_passes() {
    let report = run(Arc::new(provider("K1")), Duration::from_secs(10)).await;

    assert!(report
        .drift
        .iter()
        .all(|record| record.status == DriftStatus::Match));
    assert_eq!(report.status, RunStatus::Passed);
    assert_eq!(
        report
            .stages
            .iter()
            .map(|stage| (stage.stage, stage.outcome))
            .collect::<Vec<_>>(),
        vec![
            (RunStage::Loading, StageOutcome::Completed),
            (RunStage::Resolving, StageOutcome::Completed),
            (RunStage::GraphBuilt, StageOutcome::Completed),
            (RunStage::RulesEvaluated, StageOutcome::Completed),
            (RunStage::LiveCollected, StageOutcome::Completed),
            (RunStage::DriftCompared, StageOutcome::Completed),
            (RunStage::Reported, StageOutcome::Completed),
        ]
    );
}

#[tokio::test]
async fn throttling_is_retried() {
    let provider = Arc::new(
        provider("K1").with_failures(QUEUE_URL, [FetchError::Throttled, FetchError::Throttled]),
    );
    let report = run(Arc::clone(&provider), Duration::from_secs(10)).await;

    assert_eq!(provider.calls(QUEUE_URL), 3);
    assert!(report.fetch_errors.is_empty());
    assert_eq!(record(&report, "KmsMasterKeyId").status, DriftStatus::Match);
    assert_eq!(report.status, RunStatus::Passed);
}

#[tokio::test]
async fn persistent_failure_is_not_observable() {
    let provider = Arc::new(provider("K2").with_failures(
        QUEUE_URL,
        std::iter::repeat(FetchError::Transient("connection reset".into())).take(5),
    ));
    let report = run(Arc::clone(&provider), Duration::from_secs(10)).await;

    assert_eq!(provider.calls(QUEUE_URL), 3);
    assert_eq!(report.fetch_errors.len(), 1);
    assert_eq!(report.fetch_errors[0].resource, "Orders");
    assert_eq!(report.fetch_errors[0].attempts, 3);

    let key = record(&report, "KmsMasterKeyId");
    assert_eq!(key.status, DriftStatus::NotObservable);
    assert_eq!(key.observed, None);
    assert!(key.note.as_deref().unwrap().contains("connection reset"));
    assert!(!report
        .drift
        .iter()
        .any(|record| record.status == DriftStatus::Drift));
    assert_eq!(report.status, RunStatus::PassedWithWarnings);
}

#[tokio::test]
async fn permission_errors_are_not_retried() {
    let provider = Arc::new(provider("K1").with_failures(
        QUEUE_URL,
        [FetchError::PermissionDenied("sqs:GetQueueAttributes".into())],
    ));
    let report = run(Arc::clone(&provider), Duration::from_secs(10)).await;

    assert_eq!(provider.calls(QUEUE_URL), 1);
    assert_eq!(report.fetch_errors[0].attempts, 1);
    assert_eq!(record(&report, "QueueName").status, DriftStatus::NotObservable);
}

#[tokio::test]
async fn deadline_abandons_slow_fetches() {
    let provider = Arc::new(provider("K2").with_delay(QUEUE_URL, Duration::from_secs(30)));
    let report = run(provider, Duration::from_millis(100)).await;

    assert!(report.incomplete);
    assert_eq!(report.status, RunStatus::PassedWithWarnings);
    assert_eq!(report.fetch_errors.len(), 1);
    assert_eq!(report.fetch_errors[0].error, FetchError::Abandoned);
    assert_eq!(
        record(&report, "KmsMasterKeyId").status,
        DriftStatus::NotObservable
    );
    assert!(report
        .stages
        .iter()
        .any(|stage| stage.stage == RunStage::LiveCollected
            && stage.outcome == StageOutcome::Incomplete));
}

#[tokio::test]
async fn recorded_state_file() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/live/qa17.yaml");
    let source = std::fs::read_to_string(
        std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/templates/data-tier.yaml"),
    )
    .unwrap();
    let provider: Arc<dyn ProviderClient> = Arc::new(StaticProvider::load_file(&path).unwrap());
    let context = RunContext::new("ephemeral".into())
        .with_token("qa17")
        .with_environment("qa17");

    let report = Pipeline::new(RuleConfig::builtin())
        .with_options(options(Duration::from_secs(10)))
        .run(&source, SourceFormat::Yaml, &context, Some(provider))
        .await
        .unwrap();

    assert!(!report.incomplete);
    assert!(report.fetch_errors.is_empty());
    let multi_az = report
        .drift
        .iter()
        .find(|record| record.resource == "Orders" && record.path == FieldPath::root("MultiAZ"))
        .unwrap();
    assert_eq!(multi_az.status, DriftStatus::Match);
    assert_eq!(multi_az.severity, Severity::Info);
    assert!(report
        .drift
        .iter()
        .any(|record| record.resource == "Jobs"));
}
