//! Bindable values and typed extraction.
//!
//! # Invariants
//! - `List` only exists on the caller side of a statement: the compiler
//!   expands it into one placeholder per element before binding.
//! - Timestamps travel as epoch milliseconds.

use crate::error::{RepoError, RepoResult};
use chrono::{DateTime, Utc};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

/// Surrogate primary key assigned by the store.
pub type EntityId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
            Self::List(_) => "list",
        }
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(v) => Self::Integer(v),
            ValueRef::Real(v) => Self::Real(v),
            ValueRef::Text(bytes) => Self::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Self::Blob(bytes.to_vec()),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Self::Integer(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            Self::Real(v) => ToSqlOutput::Borrowed(ValueRef::Real(*v)),
            Self::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Self::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
            Self::List(_) => {
                return Err(rusqlite::Error::ToSqlConversionFailure(
                    "list values must be expanded before binding".into(),
                ))
            }
        })
    }
}

macro_rules! integer_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Self::Integer(i64::from(value))
            }
        })*
    };
}

integer_from!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Integer(value.timestamp_millis())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// Typed extraction from a projected column.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> RepoResult<Self>;
}

fn type_error(expected: &str, value: &Value) -> RepoError {
    RepoError::InvalidData(format!("expected {expected}, found {}", value.kind()))
}

impl FromValue for Value {
    fn from_value(value: &Value) -> RepoResult<Self> {
        Ok(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> RepoResult<Self> {
        value.as_i64().ok_or_else(|| type_error("integer", value))
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> RepoResult<Self> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide)
            .map_err(|_| RepoError::InvalidData(format!("integer {wide} out of i32 range")))
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> RepoResult<Self> {
        let wide = i64::from_value(value)?;
        u64::try_from(wide)
            .map_err(|_| RepoError::InvalidData(format!("integer {wide} is negative")))
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> RepoResult<Self> {
        match value {
            Value::Integer(0) => Ok(false),
            Value::Integer(_) => Ok(true),
            other => Err(type_error("boolean integer", other)),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> RepoResult<Self> {
        match value {
            Value::Real(v) => Ok(*v),
            Value::Integer(v) => Ok(*v as f64),
            other => Err(type_error("real", other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> RepoResult<Self> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| type_error("text", value))
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> RepoResult<Self> {
        let millis = i64::from_value(value)?;
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| RepoError::InvalidData(format!("timestamp {millis} out of range")))
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> RepoResult<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FromValue, Value};
    use chrono::{DateTime, Utc};

    #[test]
    fn options_and_lists_convert() {
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some("a")), Value::Text("a".to_string()));
        assert_eq!(
            Value::from(vec!["a", "b"]),
            Value::List(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn timestamps_round_trip_through_millis() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let value = Value::from(at);
        assert_eq!(value, Value::Integer(1_700_000_000_123));
        assert_eq!(DateTime::<Utc>::from_value(&value).unwrap(), at);
    }

    #[test]
    fn wrong_kind_is_invalid_data() {
        let err = i64::from_value(&Value::from("ten")).unwrap_err();
        assert!(err.to_string().contains("expected integer"));
        assert_eq!(Option::<i64>::from_value(&Value::Null).unwrap(), None);
    }
}
