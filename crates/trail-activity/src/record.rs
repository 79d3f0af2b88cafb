//! Log record types: action, level, canonical record and persisted rows.

use std::sync::Arc;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::{Entity, EntityId};
use crate::error::{ActivityError, BoxError};
use crate::identity::{Identity, Repositories};

/// What happened to the subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// The subject was inserted.
    Create,
    /// The subject was modified.
    Update,
    /// The subject was removed.
    Delete,
    /// Written through the manual `log` entry point.
    Custom,
}

impl Action {
    /// Returns the stored string for this action.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Custom => "custom",
        }
    }
}

/// Severity tag of a log row.
///
/// The PSR-3 names have their own variants. Any other stored string is kept
/// as [`Level::Other`], so rows written by other producers still decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Level {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    #[default]
    Info,
    Debug,
    /// A level outside the PSR-3 set.
    Other(String),
}

impl Level {
    /// Returns the stored string for this level.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Emergency => "emergency",
            Self::Alert => "alert",
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Notice => "notice",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Other(level) => level,
        }
    }
}

impl From<&str> for Level {
    fn from(s: &str) -> Self {
        match s {
            "emergency" => Self::Emergency,
            "alert" => Self::Alert,
            "critical" => Self::Critical,
            "error" => Self::Error,
            "warning" => Self::Warning,
            "notice" => Self::Notice,
            "info" => Self::Info,
            "debug" => Self::Debug,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for Level {
    fn from(s: String) -> Self {
        match Self::from(s.as_str()) {
            Self::Other(_) => Self::Other(s),
            known => known,
        }
    }
}

impl From<Level> for String {
    fn from(level: Level) -> Self {
        match level {
            Level::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for Level {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Level {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str().map(Level::from)
    }
}

/// Error returned when parsing an unknown action string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action: {0}")]
pub struct ParseTagError(String);

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "custom" => Ok(Self::Custom),
            _ => Err(ParseTagError(s.to_string())),
        }
    }
}

impl ToSql for Action {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Action {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: ParseTagError| FromSqlError::Other(Box::new(e)))
    }
}

/// The canonical record of one logical event, before fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Type of the actor that caused the event.
    pub issuer_type: Option<String>,
    /// Id of the actor that caused the event.
    pub issuer_id: Option<EntityId>,
    /// Type of the entity acted upon.
    pub subject_type: Option<String>,
    /// Id of the entity acted upon.
    pub subject_id: Option<EntityId>,
    /// What happened.
    pub action: Action,
    /// Severity tag.
    pub level: Level,
    /// Human-readable message, possibly generated.
    pub message: String,
    /// Visible field snapshot or diff of the subject.
    pub data: Option<Map<String, Value>>,
}

impl LogRecord {
    /// Builds a record for `subject` caused by `issuer`.
    ///
    /// The level starts at `info`, the message empty and the action
    /// `Custom`; callers set action and data per event kind.
    pub fn build(
        repositories: &Repositories,
        subject: Option<&dyn Entity>,
        issuer: Option<&dyn Entity>,
    ) -> Self {
        let issuer = repositories.resolve(issuer);
        let subject = repositories.resolve(subject);
        Self {
            issuer_type: issuer.type_name,
            issuer_id: issuer.id,
            subject_type: subject.type_name,
            subject_id: subject.id,
            action: Action::Custom,
            level: Level::Info,
            message: String::new(),
            data: None,
        }
    }

    /// The issuer identity pair.
    pub fn issuer(&self) -> Identity {
        Identity {
            type_name: self.issuer_type.clone(),
            id: self.issuer_id.clone(),
        }
    }

    /// The subject identity pair.
    pub fn subject(&self) -> Identity {
        Identity {
            type_name: self.subject_type.clone(),
            id: self.subject_id.clone(),
        }
    }

    /// Replaces the message with the builder's output, if one is registered.
    ///
    /// # Errors
    ///
    /// Returns [`ActivityError::MessageBuilder`] when the builder fails; the
    /// record is left unchanged.
    pub fn finalize_message(
        &mut self,
        builder: Option<&MessageBuilder>,
        context: &MessageContext<'_>,
    ) -> Result<(), ActivityError> {
        if let Some(builder) = builder {
            self.message = (**builder)(self, context).map_err(ActivityError::MessageBuilder)?;
        }
        Ok(())
    }
}

/// Objects passed to a message builder alongside the record.
#[derive(Clone, Copy, Default)]
pub struct MessageContext<'a> {
    /// The subject entity, if any.
    pub subject: Option<&'a dyn Entity>,
    /// The issuer entity, if any.
    pub issuer: Option<&'a dyn Entity>,
}

/// Hook that renders the message of a record.
///
/// Errors propagate to the caller that triggered logging. Keep builders
/// fast and free of side effects.
pub type MessageBuilder =
    Arc<dyn Fn(&LogRecord, &MessageContext<'_>) -> Result<String, BoxError> + Send + Sync>;

/// A canonical record bound to one scope entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopedLogRecord {
    /// The shared canonical record.
    #[serde(flatten)]
    pub record: LogRecord,
    /// Type under which this row is queryable.
    pub scope_type: String,
    /// Id under which this row is queryable. Never empty.
    pub scope_id: EntityId,
}

/// A row read back from (or just written to) the log table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLog {
    /// Auto-incremented row ID.
    pub id: i64,
    pub issuer_type: Option<String>,
    pub issuer_id: Option<EntityId>,
    pub subject_type: Option<String>,
    pub subject_id: Option<EntityId>,
    pub scope_type: String,
    pub scope_id: EntityId,
    pub action: Action,
    pub level: Level,
    pub message: String,
    /// Decoded `data` column.
    pub data: Option<Map<String, Value>>,
    /// SQLite `datetime('now')` text of the insert.
    pub created_at: String,
}

impl ActivityLog {
    /// Combines a written record with its generated columns.
    pub(crate) fn from_written(row: &ScopedLogRecord, id: i64, created_at: String) -> Self {
        let record = &row.record;
        Self {
            id,
            issuer_type: record.issuer_type.clone(),
            issuer_id: record.issuer_id.clone(),
            subject_type: record.subject_type.clone(),
            subject_id: record.subject_id.clone(),
            scope_type: row.scope_type.clone(),
            scope_id: row.scope_id.clone(),
            action: record.action,
            level: record.level.clone(),
            message: record.message.clone(),
            data: record.data.clone(),
            created_at,
        }
    }
}
