//! Fatal errors
//!
//! A [StructuralError] means the template cannot be analyzed at all: every later stage assumes a
//! well-formed, acyclic graph, so these abort the run. Rule violations and drift are not errors,
//! they are report data.

/// The input document is not a valid template
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("unable to parse document: {message}")]
    Syntax { message: String },
    #[error("{path}: expected {expected}")]
    UnexpectedShape { path: String, expected: &'static str },
    #[error("{path}: unknown intrinsic function `{name}`")]
    UnknownIntrinsic { path: String, name: String },
    #[error("{path}: malformed `{name}`: {reason}")]
    MalformedIntrinsic {
        path: String,
        name: String,
        reason: String,
    },
    #[error("{path}: duplicate logical id `{id}`")]
    DuplicateLogicalId { path: String, id: String },
    #[error("{path}: {reason}")]
    Unsupported { path: String, reason: String },
    #[error("template declares no resources")]
    NoResources,
}

impl ParseError {
    pub(crate) fn shape(path: impl ToString, expected: &'static str) -> Self {
        ParseError::UnexpectedShape {
            path: path.to_string(),
            expected,
        }
    }

    pub(crate) fn malformed(path: impl ToString, name: &str, reason: impl Into<String>) -> Self {
        ParseError::MalformedIntrinsic {
            path: path.to_string(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Location in the document the error refers to
    pub fn path(&self) -> Option<&str> {
        match self {
            ParseError::UnexpectedShape { path, .. }
            | ParseError::UnknownIntrinsic { path, .. }
            | ParseError::MalformedIntrinsic { path, .. }
            | ParseError::DuplicateLogicalId { path, .. }
            | ParseError::Unsupported { path, .. } => Some(path),
            ParseError::Syntax { .. } | ParseError::NoResources => None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StructuralError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("`{from}` references `{target}` which is not declared in the template")]
    DanglingReference { from: String, target: String },
    #[error("dependency cycle: {}", render_cycle(.cycle))]
    DependencyCycle { cycle: Vec<String> },
    #[error("condition cycle: {}", render_cycle(.cycle))]
    ConditionCycle { cycle: Vec<String> },
    #[error("`{from}` uses condition `{condition}` which is not declared")]
    UnknownCondition { from: String, condition: String },
    #[error("`{from}` looks up mapping `{map}` which is not declared")]
    UnknownMapping { from: String, map: String },
    #[error("`{from}` looks up `{}` in mapping `{map}` which has no such entry", .keys.join("."))]
    MissingMappingKey {
        from: String,
        map: String,
        keys: Vec<String>,
    },
    #[error("`{from}` selects index {index} from a list of {len} elements")]
    IndexOutOfRange {
        from: String,
        index: usize,
        len: usize,
    },
    #[error("`{from}` exceeds the reference depth limit of {limit}")]
    DepthExceeded { from: String, limit: usize },
    #[error("parameter `{parameter}` is `{value}`, allowed: {}", .allowed.join(", "))]
    DisallowedParameterValue {
        parameter: String,
        value: String,
        allowed: Vec<String>,
    },
}

impl StructuralError {
    /// Stable machine readable name
    pub fn kind(&self) -> &'static str {
        match self {
            StructuralError::Parse(ParseError::DuplicateLogicalId { .. }) => "duplicate-logical-id",
            StructuralError::Parse(_) => "parse-error",
            StructuralError::DanglingReference { .. } => "dangling-reference",
            StructuralError::DependencyCycle { .. } => "dependency-cycle",
            StructuralError::ConditionCycle { .. } => "condition-cycle",
            StructuralError::UnknownCondition { .. } => "unknown-condition",
            StructuralError::UnknownMapping { .. } => "unknown-mapping",
            StructuralError::MissingMappingKey { .. } => "missing-mapping-key",
            StructuralError::IndexOutOfRange { .. } => "index-out-of-range",
            StructuralError::DepthExceeded { .. } => "depth-exceeded",
            StructuralError::DisallowedParameterValue { .. } => "disallowed-parameter-value",
        }
    }

    /// Logical ids (or document locations) the error is about
    pub fn offenders(&self) -> Vec<String> {
        match self {
            StructuralError::Parse(ParseError::DuplicateLogicalId { id, .. }) => vec![id.clone()],
            StructuralError::Parse(err) => err.path().map(str::to_string).into_iter().collect(),
            StructuralError::DanglingReference { from, target } => {
                vec![from.clone(), target.clone()]
            }
            StructuralError::DependencyCycle { cycle } | StructuralError::ConditionCycle { cycle } => {
                cycle.clone()
            }
            StructuralError::UnknownCondition { from, .. }
            | StructuralError::UnknownMapping { from, .. }
            | StructuralError::MissingMappingKey { from, .. }
            | StructuralError::IndexOutOfRange { from, .. }
            | StructuralError::DepthExceeded { from, .. } => vec![from.clone()],
            StructuralError::DisallowedParameterValue { parameter, .. } => vec![parameter.clone()],
        }
    }
}

fn render_cycle(cycle: &[String]) -> String {
    let mut rendered = cycle.join(" -> ");
    if let Some(first) = cycle.first() {
        rendered.push_str(" -> ");
        rendered.push_str(first);
    }
    rendered
}
