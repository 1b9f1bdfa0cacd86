//! Drift comparison
//!
//! Compares what the template declares with what the provider reports. The fields compared for a
//! resource are the ones a rule asserted a requirement about (with that rule's severity) plus the
//! catalog's extra live fields (informational).
use crate::config::RuleConfig;
use crate::expression::ExpressionKind;
use crate::live::LiveCollection;
use crate::resolver::{Resolved, ResolvedTemplate, SkeletonPart};
use crate::rules::{Assertion, Severity};
use crate::template::Template;
use crate::util::FieldPath;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriftStatus {
    Match,
    Drift,
    NotObservable,
}

impl std::fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DriftStatus::Match => "match",
            DriftStatus::Drift => "drift",
            DriftStatus::NotObservable => "not-observable",
        })
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DriftRecord {
    pub resource: String,
    pub path: FieldPath,
    pub declared: Resolved,
    pub observed: Option<Value>,
    pub status: DriftStatus,
    pub severity: Severity,
    /// Rule that asserted the field; `None` for catalog live fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Field to compare and where the requirement came from
struct Check<'a> {
    path: &'a FieldPath,
    severity: Severity,
    rule: Option<&'a str>,
}

/// Compares every bound resource of `collection` against its declaration
///
/// Resources are visited in template order, fields in assertion order followed by catalog live
/// fields.
#[tracing::instrument(skip_all, fields(environment = %collection.environment))]
pub fn compare(
    template: &Template,
    resolved: &ResolvedTemplate,
    assertions: &[Assertion],
    config: &RuleConfig,
    collection: &LiveCollection,
) -> Vec<DriftRecord> {
    let mut records = vec![];

    for (index, node) in template.resources().iter().enumerate() {
        let bound = collection.physical_id(&node.id).is_some();
        let failure = collection.errors.get(&node.id);
        if !bound && failure.is_none() {
            continue;
        }

        let mut checks = assertions
            .iter()
            .filter(|assertion| assertion.resource == node.id)
            .map(|assertion| Check {
                path: &assertion.path,
                severity: assertion.severity,
                rule: Some(&assertion.rule),
            })
            .collect::<Vec<_>>();
        if let Some(spec) = config.resource_type(&node.resource_type) {
            for path in &spec.live_fields {
                if !checks.iter().any(|check| check.path == path) {
                    checks.push(Check {
                        path,
                        severity: Severity::Info,
                        rule: None,
                    });
                }
            }
        }

        let declared_node = resolved.node(index);
        for check in checks {
            // catalog fields the template leaves to provider defaults are not compared
            let Some(declared) = declared_node.property(check.path) else {
                continue;
            };
            let mut record = DriftRecord {
                resource: node.id.clone(),
                path: check.path.clone(),
                declared,
                observed: None,
                status: DriftStatus::NotObservable,
                severity: check.severity,
                rule: check.rule.map(str::to_string),
                note: None,
            };

            if let Some(failure) = failure {
                record.note = Some(format!("live state unavailable: {}", failure.error));
                records.push(record);
                continue;
            }
            let Some(snapshot) = collection.snapshots.get(&node.id) else {
                continue;
            };

            record.observed = snapshot.properties.get(check.path).cloned();
            let Some(expected) = reduce(&record.declared, collection) else {
                record.note = Some("declared value is only known after deployment".into());
                records.push(record);
                continue;
            };

            record.status = match &record.observed {
                None => {
                    record.note = Some("field missing from live state".into());
                    DriftStatus::Drift
                }
                Some(observed) if expected.loosely_equals(observed) => DriftStatus::Match,
                Some(_) => DriftStatus::Drift,
            };
            if record.status == DriftStatus::Drift {
                tracing::debug!(resource = %record.resource, path = %record.path, "drift");
            }
            records.push(record);
        }
    }

    tracing::info!(records = records.len(), "drift compared");
    records
}

/// Concrete value of an expectation, when it can be known now
///
/// A plain `Ref` to a bound resource becomes that resource's physical id.
fn reduce(declared: &Resolved, collection: &LiveCollection) -> Option<Value> {
    match declared {
        Resolved::Literal(value) => Some(value.clone()),
        Resolved::List(items) => items
            .iter()
            .map(|item| reduce(item, collection))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        Resolved::Map(entries) => entries
            .iter()
            .map(|(key, entry)| Some((key.clone(), reduce(entry, collection)?)))
            .collect::<Option<indexmap::IndexMap<_, _>>>()
            .map(Value::Object),
        Resolved::Symbolic(symbolic) => match (symbolic.kind, symbolic.references.as_slice()) {
            (ExpressionKind::Reference, [target]) if symbolic.skeleton == [SkeletonPart::Hole] => {
                collection.physical_id(target).map(Value::from)
            }
            _ => None,
        },
        Resolved::Unresolvable(_) => None,
    }
}
