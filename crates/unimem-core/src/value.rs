//! Semantic types and property values.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The semantic type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SemanticType {
    Text,
    Integer,
    Float,
    Boolean,
    Datetime,
    Json,
    Blob,
    Uuid,
}

impl SemanticType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticType::Text => "TEXT",
            SemanticType::Integer => "INTEGER",
            SemanticType::Float => "FLOAT",
            SemanticType::Boolean => "BOOLEAN",
            SemanticType::Datetime => "DATETIME",
            SemanticType::Json => "JSON",
            SemanticType::Blob => "BLOB",
            SemanticType::Uuid => "UUID",
        }
    }

    /// Whether `value` is a legal (non-null) value for this type.
    ///
    /// INTEGER values are accepted for FLOAT properties. NaN and infinities are not.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (SemanticType::Text, Value::Text(_))
                | (SemanticType::Integer, Value::Integer(_))
                | (SemanticType::Float, Value::Integer(_))
                | (SemanticType::Boolean, Value::Boolean(_))
                | (SemanticType::Datetime, Value::Datetime(_))
                | (SemanticType::Json, Value::Json(_))
                | (SemanticType::Blob, Value::Blob(_))
                | (SemanticType::Uuid, Value::Uuid(_))
        ) || matches!((self, value), (SemanticType::Float, Value::Float(f)) if f.is_finite())
    }

    /// Whether the ordering operators (`<`, `<=`, `>`, `>=`) apply.
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            SemanticType::Text | SemanticType::Integer | SemanticType::Float | SemanticType::Datetime
        )
    }

    /// Whether any relational filter applies at all.
    pub fn is_filterable(&self) -> bool {
        !matches!(self, SemanticType::Json | SemanticType::Blob)
    }
}

impl FromStr for SemanticType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "TEXT" => Ok(SemanticType::Text),
            "INTEGER" => Ok(SemanticType::Integer),
            "FLOAT" => Ok(SemanticType::Float),
            "BOOLEAN" => Ok(SemanticType::Boolean),
            "DATETIME" => Ok(SemanticType::Datetime),
            "JSON" => Ok(SemanticType::Json),
            "BLOB" => Ok(SemanticType::Blob),
            "UUID" => Ok(SemanticType::Uuid),
            other => Err(Error::Schema(format!("unrecognized semantic type '{other}'"))),
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A property value.
///
/// Persisted adjacently tagged (`{"type": "integer", "value": 3}`) so stored
/// records stay self-describing. DATETIME values are kept at microsecond
/// precision so range filters compare integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Datetime(#[serde(with = "chrono::serde::ts_microseconds")] DateTime<Utc>),
    Json(serde_json::Value),
    Blob(Vec<u8>),
    Uuid(Uuid),
    /// Only meaningful as the operand of an `IN` filter.
    List(Vec<Value>),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Text(_) => "text",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Boolean(_) => "boolean",
            Value::Datetime(_) => "datetime",
            Value::Json(_) => "json",
            Value::Blob(_) => "blob",
            Value::Uuid(_) => "uuid",
            Value::List(_) => "list",
        }
    }

    /// Drop sub-microsecond precision so the value survives persistence unchanged.
    pub fn normalized(self) -> Self {
        match self {
            Value::Datetime(dt) => DateTime::from_timestamp_micros(dt.timestamp_micros())
                .map(Value::Datetime)
                .unwrap_or(Value::Datetime(dt)),
            Value::List(items) => Value::List(items.into_iter().map(Value::normalized).collect()),
            other => other,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Datetime(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_semantic_type() {
        assert_eq!("text".parse::<SemanticType>().unwrap(), SemanticType::Text);
        assert_eq!(" Datetime ".parse::<SemanticType>().unwrap(), SemanticType::Datetime);
        let err = "DECIMAL".parse::<SemanticType>().unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_float_accepts_integer() {
        assert!(SemanticType::Float.accepts(&Value::Integer(3)));
        assert!(!SemanticType::Integer.accepts(&Value::Float(3.0)));
        assert!(!SemanticType::Text.accepts(&Value::Null));
    }

    #[test]
    fn test_tagged_encoding() {
        let json = serde_json::to_value(Value::Integer(2000)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "integer", "value": 2000}));

        let dt = DateTime::from_timestamp_micros(1_700_000_000_123_456).unwrap();
        let json = serde_json::to_value(Value::Datetime(dt)).unwrap();
        assert_eq!(json["value"], serde_json::json!(1_700_000_000_123_456_i64));
        let back: Value = serde_json::from_value(json).unwrap();
        assert_eq!(back, Value::Datetime(dt));
    }

    #[test]
    fn test_normalize_truncates_nanos() {
        let dt = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        match Value::Datetime(dt).normalized() {
            Value::Datetime(n) => assert_eq!(n.timestamp_subsec_nanos(), 123_456_000),
            other => panic!("unexpected {other:?}"),
        }
    }
}
