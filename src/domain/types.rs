//! Shared domain enumerations and bound parameter values.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::{PrimitiveDateTime, macros::format_description};

use super::error::DomainError;

/// Declared type of a positional query placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Int,
    Float,
    Bool,
    Text,
    Timestamp,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::Bool => "bool",
            ParamType::Text => "text",
            ParamType::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value bound to a query placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(PrimitiveDateTime),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "bool",
            SqlValue::Int(_) => "int",
            SqlValue::Float(_) => "float",
            SqlValue::Text(_) => "text",
            SqlValue::Timestamp(_) => "timestamp",
        }
    }

    /// Convert the value to the declared placeholder type.
    ///
    /// Widening `int -> float` and parsing `text -> timestamp` are the only
    /// implicit conversions; `Null` passes through unchanged.
    pub fn coerce(self, target: ParamType) -> Result<SqlValue, DomainError> {
        match (self, target) {
            (SqlValue::Null, _) => Ok(SqlValue::Null),
            (value @ SqlValue::Int(_), ParamType::Int)
            | (value @ SqlValue::Float(_), ParamType::Float)
            | (value @ SqlValue::Bool(_), ParamType::Bool)
            | (value @ SqlValue::Text(_), ParamType::Text)
            | (value @ SqlValue::Timestamp(_), ParamType::Timestamp) => Ok(value),
            (SqlValue::Int(value), ParamType::Float) => Ok(SqlValue::Float(value as f64)),
            (SqlValue::Text(value), ParamType::Timestamp) => {
                parse_timestamp(&value).map(SqlValue::Timestamp)
            }
            (value, target) => Err(DomainError::validation(format!(
                "expected {target}, got {}",
                value.kind()
            ))),
        }
    }
}

fn parse_timestamp(raw: &str) -> Result<PrimitiveDateTime, DomainError> {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    PrimitiveDateTime::parse(raw.trim(), format).map_err(|err| {
        DomainError::validation(format!(
            "`{raw}` is not a `YYYY-MM-DD HH:MM:SS` timestamp: {err}"
        ))
    })
}

/// Argument value as written in configuration files.
///
/// TOML has no null, so an argument that should bind `NULL` is simply left
/// out of the argument table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgumentValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<ArgumentValue> for SqlValue {
    fn from(value: ArgumentValue) -> Self {
        match value {
            ArgumentValue::Bool(value) => SqlValue::Bool(value),
            ArgumentValue::Int(value) => SqlValue::Int(value),
            ArgumentValue::Float(value) => SqlValue::Float(value),
            ArgumentValue::Text(value) => SqlValue::Text(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn int_widens_to_float() {
        assert_eq!(
            SqlValue::Int(3).coerce(ParamType::Float).expect("coerce"),
            SqlValue::Float(3.0)
        );
    }

    #[test]
    fn text_parses_into_timestamp() {
        let value = SqlValue::Text("2024-03-01 08:30:00".to_string())
            .coerce(ParamType::Timestamp)
            .expect("coerce");
        assert_eq!(value, SqlValue::Timestamp(datetime!(2024-03-01 08:30:00)));
    }

    #[test]
    fn mismatched_kinds_are_rejected() {
        let err = SqlValue::Text("92".to_string())
            .coerce(ParamType::Int)
            .expect_err("text is not an int");
        assert!(err.to_string().contains("expected int, got text"));
    }

    #[test]
    fn null_passes_through_any_type() {
        assert!(
            SqlValue::Null
                .coerce(ParamType::Timestamp)
                .expect("coerce")
                .is_null()
        );
    }
}
