//! Embedded schema migrations for the activity log database.
//!
//! Each migration is an SQL file compiled in with `include_str!`. Applied
//! names are recorded in `_trail_migrations`; a migration and its record
//! commit together, so a failed migration leaves no trace.

use std::collections::HashSet;

use rusqlite::Connection;
use thiserror::Error;

struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// Ordered migrations. Append only.
const MIGRATIONS: &[Migration] = &[Migration {
    name: "001_activity_logs",
    sql: include_str!("migrations/001_activity_logs.sql"),
}];

const TRACKING_TABLE: &str = "CREATE TABLE IF NOT EXISTS _trail_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

/// Errors raised while migrating the log schema.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration, or its tracking record, failed and was rolled back.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        /// Name of the failed migration.
        name: String,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// The tracking table could not be created or read.
    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),
}

/// Applies every pending migration and returns how many ran.
///
/// # Errors
///
/// Returns `MigrationError` if the tracking table is unusable or a
/// migration fails.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    run_migrations_from_list(conn, MIGRATIONS)
}

fn applied_names(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    conn.execute_batch(TRACKING_TABLE)?;
    let mut stmt = conn.prepare("SELECT name FROM _trail_migrations")?;
    let names = stmt.query_map([], |row| row.get(0))?;
    names.collect()
}

fn run_migrations_from_list(
    conn: &Connection,
    migrations: &[Migration],
) -> Result<usize, MigrationError> {
    let applied = applied_names(conn).map_err(MigrationError::StateQuery)?;
    let pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| !applied.contains(m.name))
        .collect();

    for migration in &pending {
        tracing::info!(migration = migration.name, "applying migration");
        apply(conn, migration).map_err(|source| MigrationError::ExecutionFailed {
            name: migration.name.to_string(),
            source,
        })?;
    }

    if pending.is_empty() {
        tracing::debug!("activity log schema is current");
    }
    Ok(pending.len())
}

fn apply(conn: &Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(migration.sql)?;
    tx.execute(
        "INSERT INTO _trail_migrations (name) VALUES (?1)",
        [migration.name],
    )?;
    tx.commit()
}
