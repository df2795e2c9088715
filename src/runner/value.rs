//! Input values supplied with a job request.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// A single input value of a job request.
///
/// Values arrive as JSON from the document store, so the representation
/// mirrors the JSON data model minus objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    /// An explicit null.
    Null,
    /// A boolean value.
    Bool(bool),
    /// An integer value.
    Integer(i64),
    /// A floating point value.
    Float(f64),
    /// A string value.
    String(String),
    /// A list of values (repeated or multi-file inputs).
    List(Vec<InputValue>),
}

impl InputValue {
    /// Returns `true` if the value counts as "not provided".
    ///
    /// Both `null` and `false` make an argument fall back to its default.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Null | Self::Bool(false))
    }

    /// Returns `true` if a flag argument should be emitted for the value.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Integer(_) | Self::Float(_) => true,
            Self::String(s) => !s.is_empty(),
            Self::List(l) => !l.is_empty(),
        }
    }
}

impl fmt::Display for InputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => f.write_str(s),
            Self::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for InputValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for InputValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for InputValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for InputValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl<T: Into<InputValue>> From<Vec<T>> for InputValue {
    fn from(value: Vec<T>) -> Self {
        Self::List(value.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_json_values() {
        let values: Vec<InputValue> =
            serde_json::from_str(r#"[null, true, 3, 1.5, "x", ["a", 1]]"#).unwrap();
        assert_eq!(
            values,
            [
                InputValue::Null,
                InputValue::Bool(true),
                InputValue::Integer(3),
                InputValue::Float(1.5),
                InputValue::from("x"),
                InputValue::List(vec![InputValue::from("a"), InputValue::Integer(1)]),
            ]
        );
    }

    #[test]
    fn truthiness() {
        assert!(!InputValue::Null.is_truthy());
        assert!(!InputValue::Bool(false).is_truthy());
        assert!(!InputValue::from("").is_truthy());
        assert!(!InputValue::List(Vec::new()).is_truthy());
        assert!(InputValue::Integer(0).is_truthy());
        assert!(InputValue::from("true").is_truthy());
        assert!(InputValue::from(vec!["a"]).is_truthy());
    }

    #[test]
    fn missing_values() {
        assert!(InputValue::Null.is_missing());
        assert!(InputValue::Bool(false).is_missing());
        assert!(!InputValue::from("").is_missing());
        assert!(!InputValue::Integer(0).is_missing());
    }
}
