use super::{is_set, tags, Findings, Rule, RuleInput, Severity};
use crate::resolver::Resolved;
use crate::template::NodeIndex;

/// Data stores must reference an encryption key
///
/// Severity depends on whether the resource is tagged as holding classified data.
pub struct EncryptionAtRest;

impl Rule for EncryptionAtRest {
    fn name(&self) -> &str {
        "encryption-at-rest"
    }

    fn message(&self) -> &str {
        "`{resource}` {detail}"
    }

    fn check(&self, input: &RuleInput<'_>, index: NodeIndex, findings: &mut Findings) {
        let Some(encryption) = input.spec(index).and_then(|spec| spec.encryption.as_ref()) else {
            return;
        };
        let resolved = input.resolved(index);
        let settings = &input.config.encryption;

        let classified = tags(resolved).iter().any(|(key, value)| {
            let Some(accepted) = settings.classified_tags.get(key) else {
                return false;
            };
            match value {
                Resolved::Literal(value) => match value.to_text() {
                    Some(text) => {
                        accepted.is_empty()
                            || accepted.iter().any(|candidate| candidate.eq_ignore_ascii_case(&text))
                    }
                    None => false,
                },
                // unknown until deployment: assume the worst
                _ => true,
            }
        });
        let severity = if classified {
            settings.classified_severity
        } else {
            settings.default_severity
        };

        let configured = encryption
            .key_paths
            .iter()
            .find(|path| resolved.property(path).is_some_and(|value| is_set(&value)));

        match configured {
            Some(path) => findings.assert(path.clone(), severity),
            None => {
                let checked = encryption
                    .key_paths
                    .iter()
                    .map(|path| path.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                let data = if classified { "classified data" } else { "data" };
                findings.violation(
                    severity,
                    format!("stores {data} without an encryption key (checked: {checked})"),
                    encryption.key_paths.first(),
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::rules::test::{ephemeral, evaluate};
    use crate::rules::Severity;
    use crate::template;
    use crate::util::FieldPath;
    use pretty_assertions::assert_eq;

    #[test]
    fn severity_follows_classification() {
        let template = template!(
            r#"
Resources:
  Key:
    Type: AWS::KMS::Key
  Plain:
    Type: AWS::SQS::Queue
  Secret:
    Type: AWS::SQS::Queue
    Properties:
      Tags:
        - Key: DataClassification
          Value: Confidential
  Encrypted:
    Type: AWS::SQS::Queue
    Properties:
      KmsMasterKeyId: !Ref Key
      Tags:
        DataClassification: restricted
  Disabled:
    Type: AWS::DynamoDB::Table
    Properties:
      SSESpecification:
        SSEEnabled: false
"#
        );
        let evaluation = evaluate(&template, &ephemeral());
        let found = evaluation
            .violations
            .iter()
            .filter(|v| v.rule == "encryption-at-rest")
            .map(|v| (v.resource.as_str(), v.severity))
            .collect::<Vec<_>>();

        assert_eq!(
            found,
            vec![
                ("Secret", Severity::High),
                ("Disabled", Severity::Medium),
                ("Plain", Severity::Medium),
            ]
        );

        let assertion = evaluation
            .assertions
            .iter()
            .find(|a| a.resource == "Encrypted")
            .unwrap();
        assert_eq!(assertion.path, FieldPath::root("KmsMasterKeyId"));
        assert_eq!(assertion.severity, Severity::High);
    }

    #[test]
    fn message_lists_the_checked_paths() {
        let template = template!("Resources:\n  Logs:\n    Type: AWS::Logs::LogGroup\n");
        let evaluation = evaluate(&template, &ephemeral());
        let violation = evaluation
            .violations
            .iter()
            .find(|v| v.rule == "encryption-at-rest")
            .unwrap();

        assert_eq!(
            violation.message,
            "`Logs` stores data without an encryption key (checked: KmsKeyId)"
        );
        assert_eq!(violation.path.as_deref(), Some("KmsKeyId"));
    }
}
