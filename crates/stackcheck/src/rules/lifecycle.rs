use super::{Findings, Rule, RuleInput, Severity};
use crate::template::NodeIndex;
use crate::util::FieldPath;

/// Stateful resources must declare a deletion policy allowed for the environment class
pub struct DeletionPolicy;

impl Rule for DeletionPolicy {
    fn name(&self) -> &str {
        "deletion-policy"
    }

    fn message(&self) -> &str {
        "stateful resource `{resource}` {detail}"
    }

    fn check(&self, input: &RuleInput<'_>, index: NodeIndex, findings: &mut Findings) {
        if !input.spec(index).is_some_and(|spec| spec.stateful) {
            return;
        }

        let node = input.node(index);
        if input.config.lifecycle.exemptions.contains(&node.id) {
            tracing::debug!(resource = %node.id, "exempt from deletion policy");
            return;
        }

        let class = input.environment_class();
        let Ok(allowed) = input.config.allowed_policies(class) else {
            return;
        };
        let allowed_list = allowed.join(", ");

        match &node.deletion_policy {
            None => findings.violation(
                Severity::Critical,
                format!("declares no DeletionPolicy ({class} allows: {allowed_list})"),
                Some(&FieldPath::root("DeletionPolicy")),
            ),
            Some(policy) if !allowed.contains(policy) => findings.violation(
                Severity::High,
                format!("has DeletionPolicy `{policy}` ({class} allows: {allowed_list})"),
                Some(&FieldPath::root("DeletionPolicy")),
            ),
            Some(_) => {}
        }

        if let Some(policy) = &node.update_replace_policy {
            if !allowed.contains(policy) {
                findings.violation(
                    Severity::Medium,
                    format!("has UpdateReplacePolicy `{policy}` ({class} allows: {allowed_list})"),
                    Some(&FieldPath::root("UpdateReplacePolicy")),
                );
            }
        }
    }
}
