//! End-to-end checks of the static stages on small templates

use pretty_assertions::assert_eq;
use stackcheck::config::RuleConfig;
use stackcheck::context::RunContext;
use stackcheck::graph::DependencyGraph;
use stackcheck::pipeline::{Pipeline, RunOptions};
use stackcheck::report::{Report, RunStage, RunStatus, StageOutcome};
use stackcheck::resolver::{Resolved, ResolvedTemplate};
use stackcheck::rules::{RuleEngine, RuleInput, Severity, Violation};
use stackcheck::template::{SourceFormat, Template};
use stackcheck::util::FieldPath;
use stackcheck::value::Value;

fn ephemeral() -> RunContext {
    RunContext::new("ephemeral".into()).with_token("qa17")
}

fn run(yaml: &str) -> Report {
    Pipeline::new(RuleConfig::builtin())
        .with_options(RunOptions {
            record_timings: false,
            ..Default::default()
        })
        .run_static(yaml, SourceFormat::Yaml, &ephemeral())
        .unwrap()
}

fn violations_of<'a>(report: &'a Report, rule: &str) -> Vec<&'a Violation> {
    report
        .violations
        .iter()
        .filter(|violation| violation.rule == rule)
        .collect()
}

fn resolve(yaml: &str) -> ResolvedTemplate {
    let template = Template::from_yaml_str(yaml).unwrap();
    ResolvedTemplate::resolve(&template, &ephemeral(), &RuleConfig::builtin()).unwrap()
}

#[test]
fn literals_resolve_to_themselves() {
    let resolved = resolve(
        r#"
Resources:
  Data:
    Type: AWS::S3::Bucket
    Properties:
      BucketName: qa17-data
      ObjectLockEnabled: false
      VersioningConfiguration:
        Status: Enabled
      CorsConfiguration:
        CorsRules:
          - AllowedMethods: [GET, HEAD]
            MaxAge: 3000
"#,
    );

    let property = |path: &str| resolved.property("Data", &path.parse::<FieldPath>().unwrap());

    assert_eq!(
        property("BucketName"),
        Some(Resolved::Literal(Value::from("qa17-data")))
    );
    assert_eq!(
        property("ObjectLockEnabled"),
        Some(Resolved::Literal(Value::from(false)))
    );
    assert_eq!(
        property("VersioningConfiguration"),
        Some(Resolved::Literal(Value::from(
            serde_json::json!({"Status": "Enabled"})
        )))
    );
    assert_eq!(
        property("CorsConfiguration"),
        Some(Resolved::Literal(Value::from(serde_json::json!({
            "CorsRules": [{"AllowedMethods": ["GET", "HEAD"], "MaxAge": 3000}]
        }))))
    );
}

#[test]
fn literal_interpolation_is_a_single_string() {
    let resolved = resolve(
        r#"
Parameters:
  Team:
    Type: String
    Default: orders
Resources:
  Data:
    Type: AWS::S3::Bucket
    Properties:
      BucketName: !Sub "${Team}-qa17-data"
      Description: !Join ["-", [!Ref Team, archive, !Select [1, [a, b]]]]
"#,
    );

    assert_eq!(
        resolved.property("Data", &FieldPath::root("BucketName")),
        Some(Resolved::Literal(Value::from("orders-qa17-data")))
    );
    assert_eq!(
        resolved.property("Data", &FieldPath::root("Description")),
        Some(Resolved::Literal(Value::from("orders-archive-b")))
    );
}

#[test]
fn reference_cycle_names_every_member() {
    let report = run(
        r#"
Resources:
  Alpha:
    Type: AWS::SNS::Topic
    Properties:
      DisplayName: !Ref Gamma
  Beta:
    Type: AWS::SNS::Topic
    Properties:
      DisplayName: !Ref Alpha
  Gamma:
    Type: AWS::SNS::Topic
    Properties:
      DisplayName: !Ref Beta
  Bystander:
    Type: AWS::SNS::Topic
"#,
    );

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.exit_code(), 1);
    assert!(report.violations.is_empty());
    assert!(report.drift.is_empty());

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, "dependency-cycle");
    let mut offenders = failure.offenders.clone();
    offenders.sort();
    assert_eq!(offenders, vec!["Alpha", "Beta", "Gamma"]);
    for id in ["Alpha", "Beta", "Gamma"] {
        assert!(failure.message.contains(id), "{}", failure.message);
    }
    assert!(report
        .stages
        .iter()
        .any(|stage| stage.stage == RunStage::GraphBuilt && stage.outcome == StageOutcome::Failed));
}

#[test]
fn redundant_dependency_is_one_finding_and_one_edge() {
    let yaml = r#"
Resources:
  Topic:
    Type: AWS::SNS::Topic
  Subscriber:
    Type: AWS::SQS::QueuePolicy
    DependsOn: Topic
    Properties:
      Source: !Ref Topic
"#;
    let template = Template::from_yaml_str(yaml).unwrap();
    let config = RuleConfig::builtin();
    let context = ephemeral();
    let resolved = ResolvedTemplate::resolve(&template, &context, &config).unwrap();
    let graph = DependencyGraph::build(&template).unwrap();

    let topic = template.index_of("Topic").unwrap();
    let subscriber = template.index_of("Subscriber").unwrap();
    let between = graph
        .edges()
        .iter()
        .filter(|edge| {
            (edge.from, edge.to) == (subscriber, topic) || (edge.from, edge.to) == (topic, subscriber)
        })
        .count();
    assert_eq!(between, 1);
    assert_eq!(graph.redundant().len(), 1);
    assert_eq!(graph.redundant()[0].resource, "Subscriber");
    assert_eq!(graph.redundant()[0].target, "Topic");

    let evaluation = RuleEngine::builtin()
        .evaluate(&RuleInput {
            template: &template,
            resolved: &resolved,
            graph: &graph,
            config: &config,
            context: &context,
        })
        .unwrap();
    let redundant = evaluation
        .violations
        .iter()
        .filter(|violation| violation.rule == "redundant-dependency")
        .collect::<Vec<_>>();
    assert_eq!(redundant.len(), 1);
    assert_eq!(redundant[0].resource, "Subscriber");
    assert_eq!(redundant[0].severity, Severity::Low);
}

#[test]
fn hint_listed_twice_is_reported_once() {
    let report = run(
        r#"
Resources:
  Key:
    Type: AWS::KMS::Key
    DeletionPolicy: Delete
  Queue:
    Type: AWS::SQS::Queue
    DeletionPolicy: Delete
    DependsOn: [Key, Key]
    Properties:
      KmsMasterKeyId: !GetAtt Key.Arn
"#,
    );

    let redundant = violations_of(&report, "redundant-dependency");
    assert_eq!(redundant.len(), 1);
    assert_eq!(redundant[0].resource, "Queue");
}

#[test]
fn repeated_runs_are_identical() {
    let yaml = r#"
Parameters:
  EnvToken:
    Type: String
    Default: qa17
Resources:
  Data:
    Type: AWS::S3::Bucket
    Properties:
      BucketName: data
  Queue:
    Type: AWS::SQS::Queue
    DependsOn: Data
    Properties:
      QueueName: !Sub "jobs-${EnvToken}"
      RedrivePolicy:
        deadLetterTargetArn: !GetAtt Data.Arn
"#;

    let first = run(yaml);
    let second = run(yaml);
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn names_must_carry_the_environment_token() {
    let passing = run(
        r#"
Parameters:
  EnvToken:
    Type: String
    Default: qa17
Resources:
  Orders:
    Type: AWS::S3::Bucket
    DeletionPolicy: Delete
    Properties:
      BucketName: !Sub "orders-${EnvToken}"
"#,
    );
    assert_eq!(violations_of(&passing, "naming-convention"), Vec::<&Violation>::new());

    let failing = run(
        r#"
Resources:
  Orders:
    Type: AWS::S3::Bucket
    DeletionPolicy: Delete
    Properties:
      BucketName: orders
"#,
    );
    let naming = violations_of(&failing, "naming-convention");
    assert_eq!(naming.len(), 1);
    assert_eq!(naming[0].resource, "Orders");
    assert_eq!(naming[0].severity, Severity::High);
    assert!(naming[0].message.contains("Orders"));
    assert_eq!(naming[0].path.as_deref(), Some("BucketName"));
    assert_eq!(failing.status, RunStatus::Failed);
}

#[test]
fn ephemeral_databases_need_a_deletion_policy() {
    let missing = run(
        r#"
Resources:
  Orders:
    Type: AWS::RDS::DBInstance
    Properties:
      DBInstanceIdentifier: orders-qa17
      StorageEncrypted: true
"#,
    );
    let lifecycle = violations_of(&missing, "deletion-policy");
    assert_eq!(lifecycle.len(), 1);
    assert_eq!(lifecycle[0].severity, Severity::Critical);
    assert_eq!(lifecycle[0].resource, "Orders");

    let declared = run(
        r#"
Resources:
  Orders:
    Type: AWS::RDS::DBInstance
    DeletionPolicy: Delete
    Properties:
      DBInstanceIdentifier: orders-qa17
      StorageEncrypted: true
"#,
    );
    assert!(violations_of(&declared, "deletion-policy").is_empty());
    assert_eq!(declared.status, RunStatus::Passed);
}

#[test]
fn open_database_port_is_critical() {
    let report = run(
        r#"
Resources:
  DatabaseGroup:
    Type: AWS::EC2::SecurityGroup
    Properties:
      GroupDescription: database
      SecurityGroupIngress:
        - IpProtocol: tcp
          FromPort: 5432
          ToPort: 5432
          CidrIp: 0.0.0.0/0
"#,
    );

    let exposure = violations_of(&report, "network-exposure");
    assert_eq!(exposure.len(), 1);
    assert_eq!(exposure[0].severity, Severity::Critical);
    assert_eq!(exposure[0].resource, "DatabaseGroup");
    assert!(exposure[0].message.contains("5432"), "{}", exposure[0].message);
    assert_eq!(
        exposure[0].path.as_deref(),
        Some("SecurityGroupIngress.0.CidrIp")
    );
}

#[test]
fn open_web_port_on_a_load_balancer_is_fine() {
    let report = run(
        r#"
Resources:
  WebGroup:
    Type: AWS::EC2::SecurityGroup
    Properties:
      GroupDescription: web
      SecurityGroupIngress:
        - IpProtocol: tcp
          FromPort: 443
          ToPort: 443
          CidrIp: 0.0.0.0/0
  Balancer:
    Type: AWS::ElasticLoadBalancingV2::LoadBalancer
    Properties:
      Name: web-qa17
      SecurityGroups:
        - !GetAtt WebGroup.GroupId
"#,
    );

    assert!(violations_of(&report, "network-exposure").is_empty());
}
