use super::{Findings, Rule, RuleInput, Severity};
use crate::template::NodeIndex;
use crate::util::FieldPath;

/// `DependsOn` entries already enforced by a reference
pub struct RedundantDependencyRule;

impl Rule for RedundantDependencyRule {
    fn name(&self) -> &str {
        "redundant-dependency"
    }

    fn message(&self) -> &str {
        "`{resource}` {detail}"
    }

    fn check(&self, input: &RuleInput<'_>, index: NodeIndex, findings: &mut Findings) {
        let id = &input.node(index).id;
        for redundant in input.graph.redundant().iter().filter(|r| &r.resource == id) {
            findings.violation(
                Severity::Low,
                format!(
                    "depends on `{}` explicitly, but already references it",
                    redundant.target
                ),
                Some(&FieldPath::root("DependsOn")),
            );
        }
    }
}

#[cfg(test)]
mod test {
    use crate::rules::test::{ephemeral, evaluate};
    use crate::rules::{Severity, Violation};
    use crate::template;
    use pretty_assertions::assert_eq;

    #[test]
    fn one_finding_per_redundant_hint() {
        let template = template!(
            r#"
Resources:
  Topic:
    Type: AWS::SNS::Topic
    Properties:
      TopicName: alerts-qa17
  Role:
    Type: AWS::IAM::Role
    DependsOn: [Topic, Other]
    Properties:
      RoleName: !Sub "${Topic.TopicName}-role"
  Other:
    Type: AWS::IAM::Role
"#
        );
        let found = evaluate(&template, &ephemeral())
            .violations
            .into_iter()
            .filter(|v| v.rule == "redundant-dependency")
            .collect::<Vec<_>>();

        assert_eq!(
            found,
            vec![Violation {
                rule: "redundant-dependency".into(),
                resource: "Role".into(),
                severity: Severity::Low,
                message: "`Role` depends on `Topic` explicitly, but already references it".into(),
                path: Some("DependsOn".into()),
            }]
        );
    }
}
