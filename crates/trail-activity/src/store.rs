//! Persistence of scoped log rows.
//!
//! Every batch is written inside a named SQLite savepoint. Outside a
//! transaction the savepoint behaves like `BEGIN`; inside one opened by the
//! host it nests, so rolling back a failed batch never touches the host's
//! own writes. A batch is visible completely or not at all.
//!
//! Reads go through [`find_logs`], which filters on scope, action and level
//! and returns the newest rows first.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::ToSql;
use rusqlite::{params, Connection, Row, Transaction};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::entity::EntityId;
use crate::error::{InvalidTableName, PersistError};
use crate::record::{Action, ActivityLog, Level, ScopedLogRecord};

/// Table written when no log store target is configured.
pub const DEFAULT_LOG_TABLE: &str = "activity_logs";

const SAVEPOINT: &str = "trail_activity_batch";

/// A validated log table name: ASCII letters, digits and underscores, not
/// starting with a digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TableName(String);

impl TableName {
    /// Validates `name` as a plain SQL identifier.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTableName`] for empty names or names with other
    /// characters.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidTableName> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            Ok(Self(name))
        } else {
            Err(InvalidTableName(name))
        }
    }

    /// Returns the table name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TableName {
    fn default() -> Self {
        Self(DEFAULT_LOG_TABLE.to_string())
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TableName {
    type Err = InvalidTableName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Filter criteria for reading log rows.
#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    /// Rows queryable under this type.
    pub scope_type: Option<String>,
    /// Rows queryable under this id.
    pub scope_id: Option<EntityId>,
    /// Rows with this action.
    pub action: Option<Action>,
    /// Rows with this level.
    pub level: Option<Level>,
    /// Maximum number of rows; unbounded when `None`.
    pub limit: Option<i64>,
}

/// Sink for scoped log rows.
///
/// Implemented for connections, transactions, the connection pool and
/// references to any store.
pub trait LogStore {
    /// Persists `rows` atomically and returns them with their generated
    /// columns.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] when any row fails; none of the batch is
    /// then visible.
    fn save_atomic(
        &self,
        table: &TableName,
        rows: &[ScopedLogRecord],
    ) -> Result<Vec<ActivityLog>, PersistError>;

    /// Reads rows matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] on SQL or payload decoding failure.
    fn find(
        &self,
        table: &TableName,
        filter: &ActivityFilter,
    ) -> Result<Vec<ActivityLog>, PersistError>;
}

impl LogStore for Connection {
    fn save_atomic(
        &self,
        table: &TableName,
        rows: &[ScopedLogRecord],
    ) -> Result<Vec<ActivityLog>, PersistError> {
        save_atomic(self, table, rows)
    }

    fn find(
        &self,
        table: &TableName,
        filter: &ActivityFilter,
    ) -> Result<Vec<ActivityLog>, PersistError> {
        find_logs(self, table, filter)
    }
}

impl LogStore for Transaction<'_> {
    fn save_atomic(
        &self,
        table: &TableName,
        rows: &[ScopedLogRecord],
    ) -> Result<Vec<ActivityLog>, PersistError> {
        save_atomic(self, table, rows)
    }

    fn find(
        &self,
        table: &TableName,
        filter: &ActivityFilter,
    ) -> Result<Vec<ActivityLog>, PersistError> {
        find_logs(self, table, filter)
    }
}

impl LogStore for trail_db::DbPool {
    fn save_atomic(
        &self,
        table: &TableName,
        rows: &[ScopedLogRecord],
    ) -> Result<Vec<ActivityLog>, PersistError> {
        let conn = self.get()?;
        save_atomic(&conn, table, rows)
    }

    fn find(
        &self,
        table: &TableName,
        filter: &ActivityFilter,
    ) -> Result<Vec<ActivityLog>, PersistError> {
        let conn = self.get()?;
        find_logs(&conn, table, filter)
    }
}

impl<T: LogStore + ?Sized> LogStore for &T {
    fn save_atomic(
        &self,
        table: &TableName,
        rows: &[ScopedLogRecord],
    ) -> Result<Vec<ActivityLog>, PersistError> {
        (**self).save_atomic(table, rows)
    }

    fn find(
        &self,
        table: &TableName,
        filter: &ActivityFilter,
    ) -> Result<Vec<ActivityLog>, PersistError> {
        (**self).find(table, filter)
    }
}

/// Creates a log table with the standard columns if it does not exist.
///
/// The default table is created by `trail_db::run_migrations`; this is for
/// additional log store targets.
///
/// # Errors
///
/// Returns `PersistError::Database` on SQL failure.
pub fn create_log_table(conn: &Connection, table: &TableName) -> Result<(), PersistError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            issuer_type TEXT,
            issuer_id,
            subject_type TEXT,
            subject_id,
            scope_type TEXT NOT NULL,
            scope_id NOT NULL,
            action TEXT NOT NULL,
            level TEXT NOT NULL DEFAULT 'info',
            message TEXT NOT NULL DEFAULT '',
            data TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS \"idx_{table}_scope\" ON \"{table}\" (scope_type, scope_id);"
    ))?;
    Ok(())
}

/// Writes `rows` to `table` inside a savepoint.
///
/// An empty batch writes nothing and opens no savepoint. On any failure,
/// including a failed release, the savepoint is rolled back and released
/// before the error is returned.
///
/// # Errors
///
/// Returns `PersistError::Serialization` if a payload cannot be encoded
/// (before anything is written) or `PersistError::Database` on SQL failure.
pub fn save_atomic(
    conn: &Connection,
    table: &TableName,
    rows: &[ScopedLogRecord],
) -> Result<Vec<ActivityLog>, PersistError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let payloads = rows
        .iter()
        .map(|row| row.record.data.as_ref().map(serde_json::to_string).transpose())
        .collect::<Result<Vec<_>, _>>()?;

    let savepoint = BatchSavepoint::open(conn, table)?;
    let saved = insert_rows(conn, table, rows, &payloads)?;
    savepoint.release()?;
    Ok(saved)
}

/// Open batch savepoint. Rolled back on drop unless released.
struct BatchSavepoint<'c> {
    conn: &'c Connection,
    table: &'c TableName,
    /// The savepoint started the transaction (no host transaction was open).
    outermost: bool,
    released: bool,
}

impl<'c> BatchSavepoint<'c> {
    fn open(conn: &'c Connection, table: &'c TableName) -> rusqlite::Result<Self> {
        let outermost = conn.is_autocommit();
        conn.execute_batch(&format!("SAVEPOINT {SAVEPOINT}"))?;
        Ok(Self {
            conn,
            table,
            outermost,
            released: false,
        })
    }

    /// Releases the savepoint. As the outermost savepoint this commits, which
    /// can fail on deferred constraints; the drop then rolls the batch back.
    fn release(mut self) -> rusqlite::Result<()> {
        self.conn
            .execute_batch(&format!("RELEASE SAVEPOINT {SAVEPOINT}"))?;
        self.released = true;
        Ok(())
    }
}

impl Drop for BatchSavepoint<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let rollback = self.conn.execute_batch(&format!(
            "ROLLBACK TO SAVEPOINT {SAVEPOINT}; RELEASE SAVEPOINT {SAVEPOINT}"
        ));
        if let Err(e) = rollback {
            tracing::warn!(
                table = self.table.as_str(),
                error = %e,
                "failed to roll back activity log savepoint"
            );
            if self.outermost && !self.conn.is_autocommit() {
                if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                    tracing::warn!(
                        table = self.table.as_str(),
                        error = %e,
                        "failed to abort activity log transaction"
                    );
                }
            }
        }
    }
}

fn insert_rows(
    conn: &Connection,
    table: &TableName,
    rows: &[ScopedLogRecord],
    payloads: &[Option<String>],
) -> Result<Vec<ActivityLog>, PersistError> {
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO \"{table}\"
            (issuer_type, issuer_id, subject_type, subject_id, scope_type, scope_id,
             action, level, message, data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, datetime('now'))
         RETURNING id, created_at"
    ))?;

    let mut saved = Vec::with_capacity(rows.len());
    for (row, payload) in rows.iter().zip(payloads) {
        let record = &row.record;
        let (id, created_at) = stmt.query_row(
            params![
                record.issuer_type,
                record.issuer_id,
                record.subject_type,
                record.subject_id,
                row.scope_type,
                row.scope_id,
                record.action,
                record.level,
                record.message,
                payload,
            ],
            |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)),
        )?;
        saved.push(ActivityLog::from_written(row, id, created_at));
    }
    Ok(saved)
}

/// Reads rows from `table` matching `filter`, ordered by `id` descending.
///
/// # Errors
///
/// Returns `PersistError::Database` on SQL failure or when a stored
/// payload cannot be decoded.
pub fn find_logs(
    conn: &Connection,
    table: &TableName,
    filter: &ActivityFilter,
) -> Result<Vec<ActivityLog>, PersistError> {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(ref scope_type) = filter.scope_type {
        values.push(Box::new(scope_type.clone()));
        clauses.push(format!("scope_type = ?{}", values.len()));
    }
    if let Some(ref scope_id) = filter.scope_id {
        values.push(Box::new(scope_id.clone()));
        clauses.push(format!("scope_id = ?{}", values.len()));
    }
    if let Some(action) = filter.action {
        values.push(Box::new(action));
        clauses.push(format!("action = ?{}", values.len()));
    }
    if let Some(ref level) = filter.level {
        values.push(Box::new(level.clone()));
        clauses.push(format!("level = ?{}", values.len()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    // SQLite treats a negative LIMIT as unbounded.
    values.push(Box::new(filter.limit.unwrap_or(-1)));
    let sql = format!(
        "SELECT id, issuer_type, issuer_id, subject_type, subject_id, scope_type, scope_id,
                action, level, message, data, created_at
         FROM \"{table}\"
         {where_clause}
         ORDER BY id DESC
         LIMIT ?{}",
        values.len()
    );

    let params: Vec<&dyn ToSql> = values.iter().map(|v| &**v).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), read_row)?;

    let mut logs = Vec::new();
    for row in rows {
        logs.push(row?);
    }
    Ok(logs)
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<ActivityLog> {
    let data: Option<Map<String, Value>> = row
        .get::<_, Option<String>>(10)?
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(ActivityLog {
        id: row.get(0)?,
        issuer_type: row.get(1)?,
        issuer_id: row.get(2)?,
        subject_type: row.get(3)?,
        subject_id: row.get(4)?,
        scope_type: row.get(5)?,
        scope_id: row.get(6)?,
        action: row.get(7)?,
        level: row.get(8)?,
        message: row.get(9)?,
        data,
        created_at: row.get(11)?,
    })
}
