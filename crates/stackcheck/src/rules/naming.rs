use super::{Findings, Rule, RuleInput, Severity};
use crate::resolver::Resolved;
use crate::template::NodeIndex;
use crate::util::FieldPath;

/// Externally visible names must carry the environment token
pub struct NamingConvention;

impl Rule for NamingConvention {
    fn name(&self) -> &str {
        "naming-convention"
    }

    fn message(&self) -> &str {
        "name of `{resource}` {detail}"
    }

    fn check(&self, input: &RuleInput<'_>, index: NodeIndex, findings: &mut Findings) {
        let Some(token) = input.context.environment_token.as_deref() else {
            return;
        };
        let Some(name_property) = input.spec(index).and_then(|spec| spec.name_property.as_deref())
        else {
            return;
        };

        let path = FieldPath::root(name_property);
        // no name at all: the provider generates a unique one
        let Some(name) = input.resolved(index).property(&path) else {
            return;
        };

        let token = token.to_lowercase();
        let contains = |text: &str| text.to_lowercase().contains(&token);

        match &name {
            Resolved::Literal(value) => match value.to_text() {
                Some(text) if contains(&text) => findings.assert(path, Severity::High),
                Some(text) => findings.violation(
                    Severity::High,
                    format!("`{text}` does not contain the environment token `{token}`"),
                    Some(&path),
                ),
                None => findings.violation(Severity::Low, "is not a string", Some(&path)),
            },
            Resolved::Symbolic(symbolic) => {
                if !symbolic.texts().any(contains) {
                    findings.violation(
                        Severity::High,
                        format!("`{symbolic}` does not contain the environment token `{token}`"),
                        Some(&path),
                    );
                }
            }
            Resolved::Unresolvable(unresolvable) => findings.violation(
                Severity::Low,
                format!("cannot be checked: {}", unresolvable.reason),
                Some(&path),
            ),
            Resolved::List(_) | Resolved::Map(_) => {
                findings.violation(Severity::Low, "is not a string", Some(&path))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::rules::test::{ephemeral, evaluate};
    use crate::rules::Severity;
    use crate::template;
    use pretty_assertions::assert_eq;

    fn naming(yaml: &str) -> Vec<(String, Severity, String)> {
        let template = crate::template::Template::from_yaml_str(yaml).unwrap();
        evaluate(&template, &ephemeral())
            .violations
            .into_iter()
            .filter(|v| v.rule == "naming-convention")
            .map(|v| (v.resource, v.severity, v.message))
            .collect()
    }

    #[test]
    fn literal_and_interpolated_names() {
        let found = naming(
            r#"
Parameters:
  Env:
    Type: String
    Default: QA17
Resources:
  Literal:
    Type: AWS::SQS::Queue
    Properties:
      QueueName: jobs-qa17
  Interpolated:
    Type: AWS::S3::Bucket
    Properties:
      BucketName: !Sub "data-${Env}"
  Unnamed:
    Type: AWS::SNS::Topic
  Wrong:
    Type: AWS::DynamoDB::Table
    Properties:
      TableName: orders-prod
"#,
        );

        assert_eq!(
            found,
            vec![(
                "Wrong".to_string(),
                Severity::High,
                "name of `Wrong` `orders-prod` does not contain the environment token `qa17`"
                    .to_string()
            )]
        );
    }

    #[test]
    fn symbolic_names_use_the_skeleton() {
        let found = naming(
            r#"
Resources:
  Good:
    Type: AWS::SQS::Queue
    Properties:
      QueueName: !Sub "qa17-${AWS::StackName}"
  Bad:
    Type: AWS::SQS::Queue
    Properties:
      QueueName: !Sub "${AWS::StackName}-jobs"
  Opaque:
    Type: AWS::SQS::Queue
    Properties:
      QueueName: !Select [!GetAtt Good.Index, [a, b]]
"#,
        );

        assert_eq!(
            found.iter().map(|(id, severity, _)| (id.as_str(), *severity)).collect::<Vec<_>>(),
            vec![("Bad", Severity::High), ("Opaque", Severity::Low)]
        );
    }

    #[test]
    fn no_token_no_check() {
        let template = template!(
            r#"
Resources:
  Queue:
    Type: AWS::SQS::Queue
    Properties:
      QueueName: anything
"#
        );
        let context = crate::context::RunContext::new("ephemeral".into());
        let evaluation = evaluate(&template, &context);
        assert!(evaluation.violations.iter().all(|v| v.rule != "naming-convention"));
    }
}
