//! Domain entity abstraction and field snapshots.
//!
//! The host framework owns its entities; this crate only needs to know which
//! repository an entity belongs to, how to read a field, and which fields are
//! visible. Hidden fields never reach a log payload.

use std::collections::BTreeSet;
use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A primary key value: integer or text.
///
/// `0` and `""` count as empty. An empty id is treated as unresolved and is
/// never written as a scope id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    /// Integer key.
    Int(i64),
    /// Text key (UUIDs, slugs).
    Text(String),
}

impl EntityId {
    /// Returns `true` for `0` and the empty string.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Int(v) => *v == 0,
            Self::Text(s) => s.is_empty(),
        }
    }

    /// Converts a JSON field value into an id. Only integers and strings
    /// are accepted.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for EntityId {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl ToSql for EntityId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Int(v) => ToSqlOutput::from(*v),
            Self::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

impl FromSql for EntityId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Integer(v) => Ok(Self::Int(v)),
            ValueRef::Text(bytes) => std::str::from_utf8(bytes)
                .map(|s| Self::Text(s.to_string()))
                .map_err(|e| FromSqlError::Other(Box::new(e))),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// A domain object that can be logged, used as an issuer, or named in a
/// scope.
pub trait Entity: Send + Sync {
    /// Key of the repository that owns this entity.
    fn source(&self) -> &str;

    /// Reads a single field, hidden or not.
    fn field(&self, name: &str) -> Option<Value>;

    /// Snapshot of every non-hidden field.
    fn visible_fields(&self) -> Map<String, Value>;
}

/// Full visible snapshot, or `None` when there is no entity.
pub fn full_snapshot(entity: Option<&dyn Entity>) -> Option<Map<String, Value>> {
    entity.map(|e| e.visible_fields())
}

/// Visible snapshot restricted to the changed fields.
pub fn dirty_snapshot(
    entity: Option<&dyn Entity>,
    changed_fields: &[&str],
) -> Option<Map<String, Value>> {
    entity.map(|e| {
        e.visible_fields()
            .into_iter()
            .filter(|(name, _)| changed_fields.contains(&name.as_str()))
            .collect()
    })
}

/// Map-backed [`Entity`] for hosts without their own entity types.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityRecord {
    source: String,
    fields: Map<String, Value>,
    hidden: BTreeSet<String>,
}

impl EntityRecord {
    /// Creates an empty record owned by `source`.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            fields: Map::new(),
            hidden: BTreeSet::new(),
        }
    }

    /// Builder form of [`EntityRecord::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Marks a field hidden so it is excluded from snapshots.
    pub fn hidden(mut self, name: impl Into<String>) -> Self {
        self.hidden.insert(name.into());
        self
    }

    /// Sets a field value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }
}

impl Entity for EntityRecord {
    fn source(&self) -> &str {
        &self.source
    }

    fn field(&self, name: &str) -> Option<Value> {
        self.fields.get(name).cloned()
    }

    fn visible_fields(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .filter(|(name, _)| !self.hidden.contains(name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}
