//! Typed statement parameters.
//!
//! Parameters participate in query-cache keys, so equality and hashing are
//! by content: two blobs with the same bytes are the same parameter, and
//! floats compare by bit pattern.

use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, Value};
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// A single bound statement parameter.
#[derive(Debug, Clone)]
pub enum Param {
    Null,
    I32(i32),
    I64(i64),
    F64(f64),
    Text(String),
    Blob(Vec<u8>),
    Bool(bool),
    /// Bound as hyphenated text.
    Uuid(Uuid),
}

impl Param {
    #[must_use]
    pub const fn i32(value: i32) -> Self {
        Self::I32(value)
    }

    #[must_use]
    pub const fn i64(value: i64) -> Self {
        Self::I64(value)
    }

    #[must_use]
    pub const fn f64(value: f64) -> Self {
        Self::F64(value)
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn blob(value: impl Into<Vec<u8>>) -> Self {
        Self::Blob(value.into())
    }

    #[must_use]
    pub const fn bool(value: bool) -> Self {
        Self::Bool(value)
    }

    #[must_use]
    pub const fn uuid(value: Uuid) -> Self {
        Self::Uuid(value)
    }

    /// Short type tag, used in diagnostics and CLI output.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::I32(_) => "i32",
            Self::I64(_) => "i64",
            Self::F64(_) => "f64",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
            Self::Bool(_) => "bool",
            Self::Uuid(_) => "uuid",
        }
    }

    /// Parse a loosely-typed command-line argument: integers first, then
    /// floats, `null`, and finally text.
    #[must_use]
    pub fn parse_loose(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("null") {
            return Self::Null;
        }
        if let Ok(value) = raw.parse::<i64>() {
            return Self::I64(value);
        }
        if let Ok(value) = raw.parse::<f64>() {
            return Self::F64(value);
        }
        Self::Text(raw.to_string())
    }
}

impl PartialEq for Param {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::I32(a), Self::I32(b)) => a == b,
            (Self::I64(a), Self::I64(b)) => a == b,
            (Self::F64(a), Self::F64(b)) => a.to_bits() == b.to_bits(),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Blob(a), Self::Blob(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Uuid(a), Self::Uuid(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Param {}

impl Hash for Param {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::I32(v) => v.hash(state),
            Self::I64(v) => v.hash(state),
            Self::F64(v) => v.to_bits().hash(state),
            Self::Text(v) => v.hash(state),
            Self::Blob(v) => v.hash(state),
            Self::Bool(v) => v.hash(state),
            Self::Uuid(v) => v.hash(state),
        }
    }
}

impl ToSql for Param {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Self::Null => Ok(ToSqlOutput::Owned(Value::Null)),
            Self::I32(v) => v.to_sql(),
            Self::I64(v) => v.to_sql(),
            Self::F64(v) => v.to_sql(),
            Self::Text(v) => v.to_sql(),
            Self::Blob(v) => v.to_sql(),
            Self::Bool(v) => v.to_sql(),
            Self::Uuid(v) => Ok(ToSqlOutput::Owned(Value::Text(v.hyphenated().to_string()))),
        }
    }
}

impl From<i32> for Param {
    fn from(value: i32) -> Self {
        Self::I32(value)
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<f64> for Param {
    fn from(value: f64) -> Self {
        Self::F64(value)
    }
}

impl From<bool> for Param {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for Param {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

impl From<Uuid> for Param {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for Param {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
