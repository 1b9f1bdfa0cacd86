use super::{tags, Findings, Rule, RuleInput, Severity};
use crate::template::NodeIndex;
use crate::util::FieldPath;

/// Taggable resources must carry every configured tag key
pub struct RequiredTags;

impl Rule for RequiredTags {
    fn name(&self) -> &str {
        "required-tags"
    }

    fn message(&self) -> &str {
        "`{resource}` is missing required tags: {detail}"
    }

    fn check(&self, input: &RuleInput<'_>, index: NodeIndex, findings: &mut Findings) {
        let required = &input.config.tagging.required;
        if required.is_empty() || !input.spec(index).is_some_and(|spec| spec.taggable) {
            return;
        }

        let present = tags(input.resolved(index));
        let missing = required
            .iter()
            .filter(|key| !present.iter().any(|(present, _)| present == *key))
            .map(String::as_str)
            .collect::<Vec<_>>();

        if !missing.is_empty() {
            findings.violation(Severity::Medium, missing.join(", "), Some(&FieldPath::root("Tags")));
        }
    }
}

#[cfg(test)]
mod test {
    use crate::config::RuleConfig;
    use crate::rules::test::{ephemeral, evaluate_with};
    use crate::template;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_tags() {
        let template = template!(
            r#"
Resources:
  Tagged:
    Type: AWS::SNS::Topic
    Properties:
      Tags:
        - { Key: Owner, Value: platform }
        - { Key: CostCenter, Value: !Ref "AWS::AccountId" }
  Partial:
    Type: AWS::SNS::Topic
    Properties:
      Tags:
        - { Key: Owner, Value: platform }
  NotTaggable:
    Type: AWS::EC2::SecurityGroupIngress
"#
        );
        let mut config = RuleConfig::builtin();
        config.tagging.required = vec!["Owner".into(), "CostCenter".into()];

        let messages = evaluate_with(&template, &ephemeral(), &config)
            .violations
            .into_iter()
            .filter(|v| v.rule == "required-tags")
            .map(|v| v.message)
            .collect::<Vec<_>>();

        assert_eq!(messages, vec!["`Partial` is missing required tags: CostCenter"]);
    }
}
