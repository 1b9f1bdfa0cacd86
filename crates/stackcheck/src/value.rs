//! value representation
//!
//! Terminal data of a template after resolution, and of a live snapshot as
//! returned by a provider.
//! - null
//! - boolean (true/false)
//! - integer (signed, i64)
//! - decimal (f64)
//! - string (utf-8)
//! - array ("list" of values)
//! - object (order-preserving "map"/"dictionary", where the key is of type string)
//!
//! Property order is preserved everywhere so that reports are deterministic.
use crate::util::{FieldPath, PathSegment};
use serde::{
    ser::{SerializeMap, SerializeSeq},
    Serializer,
};

/// All possible value types
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    String(String),
    Array(Vec<Value>),
    Object(indexmap::IndexMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
    }

    /// Integer view of a value, accepting numeric strings
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Decimal(d) if d.fract() == 0.0 => Some(*d as i64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Text used when a scalar is spliced into a string
    ///
    /// Returns `None` for values that have no string form (null, arrays, objects).
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Boolean(b) => Some(b.to_string()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Decimal(d) => Some(d.to_string()),
            Value::String(s) => Some(s.clone()),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Array(_) | Value::Object(_))
    }

    pub fn get_path(&self, path: &[PathSegment]) -> Option<&Value> {
        let Some((first, rest)) = path.split_first() else {
            return Some(self);
        };

        let next = match (self, first) {
            (Value::Object(map), segment) => map.get(segment.as_key().as_ref()),
            (Value::Array(items), PathSegment::Index(index)) => items.get(*index),
            _ => None,
        }?;

        next.get_path(rest)
    }

    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        self.get_path(path.segments())
    }

    /// Equality that tolerates the scalar encodings providers use
    ///
    /// `"5432"` equals `5432`, `"true"` equals `true`. Objects compare by key set
    /// regardless of order.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.loosely_equals(b))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(key, a)| b.get(key).is_some_and(|b| a.loosely_equals(b)))
            }
            (Value::Null, Value::Null) => true,
            (a, b) if a.is_scalar() && b.is_scalar() => match (a.to_text(), b.to_text()) {
                (Some(a), Some(b)) => {
                    a == b
                        || match (self.as_f64(), other.as_f64()) {
                            (Some(a), Some(b)) => a == b,
                            _ => a.eq_ignore_ascii_case(&b) && self.as_bool().is_some(),
                        }
                }
                _ => false,
            },
            _ => false,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Decimal(d) => Some(*d),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            other => match serde_json::to_string(other) {
                Ok(rendered) => f.write_str(&rendered),
                Err(_) => Err(std::fmt::Error),
            },
        }
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::Array(value.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Number> for Value {
    fn from(value: serde_json::Number) -> Self {
        if let Some(int) = value.as_i64() {
            return Value::Integer(int);
        }

        // u64 beyond i64::MAX and floats both land here
        Value::Decimal(value.as_f64().unwrap_or(f64::NAN))
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => b.into(),
            serde_json::Value::Number(n) => n.into(),
            serde_json::Value::String(s) => s.into(),
            serde_json::Value::Array(a) => a.into(),
            serde_json::Value::Object(o) => {
                Value::Object(o.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl serde::ser::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Boolean(value) => serializer.serialize_bool(*value),
            Value::Integer(value) => serializer.serialize_i64(*value),
            Value::Decimal(value) => serializer.serialize_f64(*value),
            Value::String(value) => serializer.serialize_str(value),
            Value::Array(value) => {
                let mut ser = serializer.serialize_seq(Some(value.len()))?;
                for element in value {
                    ser.serialize_element(element)?;
                }
                ser.end()
            }
            Value::Object(value) => {
                let mut ser = serializer.serialize_map(Some(value.len()))?;
                for (element_key, element_value) in value {
                    ser.serialize_entry(element_key, element_value)?;
                }
                ser.end()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn json_conversion_keeps_order() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"zeta": 1, "alpha": [true, "x"], "mid": 1.5}"#).unwrap();
        let value = Value::from(json);

        let Value::Object(map) = &value else {
            panic!("expected object");
        };
        assert_eq!(
            map.keys().collect::<Vec<_>>(),
            vec!["zeta", "alpha", "mid"]
        );
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"{"zeta":1,"alpha":[true,"x"],"mid":1.5}"#
        );
    }

    #[test]
    fn path_lookup() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"a": {"b": [{"c": "found"}]}}"#).unwrap();
        let value = Value::from(json);

        let path: FieldPath = "a.b.0.c".parse().unwrap();
        assert_eq!(value.get(&path), Some(&Value::from("found")));

        let missing: FieldPath = "a.b.1.c".parse().unwrap();
        assert_eq!(value.get(&missing), None);
    }

    #[test]
    fn loose_equality() {
        assert!(Value::from("5432").loosely_equals(&Value::Integer(5432)));
        assert!(Value::from("TRUE").loosely_equals(&Value::Boolean(true)));
        assert!(!Value::from("K1").loosely_equals(&Value::from("K2")));
        assert!(!Value::from("k1").loosely_equals(&Value::from("K1")));
        assert!(!Value::Null.loosely_equals(&Value::from("")));
    }
}
