//! SQLite connections for the activity log: pooled or standalone, both with
//! the same pragmas.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

use crate::migrations::{run_migrations, MigrationError};

/// Connection tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a writer waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Upper bound on pooled connections.
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

/// Pool of activity log connections.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Errors raised while opening log databases.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool could not be built or could not hand out a connection.
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),

    /// A standalone connection could not be opened or configured.
    #[error("failed to open database: {0}")]
    Open(#[from] rusqlite::Error),

    /// The log schema could not be brought up to date.
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

fn open_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX
}

/// Applies WAL journaling and the busy timeout to `conn`.
///
/// In-memory databases cannot use WAL and report `memory`; that is accepted.
fn configure(conn: &Connection, settings: DbRuntimeSettings) -> rusqlite::Result<()> {
    let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    if !matches!(journal_mode.as_str(), "wal" | "memory") {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal_mode stayed {journal_mode}, expected wal")),
        ));
    }
    conn.busy_timeout(std::time::Duration::from_millis(settings.busy_timeout_ms))
}

/// Creates a connection pool for the log database at `db_path`.
///
/// `db_path` may be `:memory:`, but every pooled connection then opens its
/// own private database. Use a file path when log rows must be visible
/// across connections.
///
/// # Errors
///
/// Returns `PoolError::PoolInit` if the pool cannot be built.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(open_flags())
        .with_init(move |conn| configure(conn, settings));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?;

    tracing::debug!(
        path = db_path,
        max_size = settings.pool_max_size,
        "created activity log pool"
    );

    Ok(pool)
}

/// Creates a pool and brings the log schema up to date through one of its
/// connections.
///
/// # Errors
///
/// Returns `PoolError` if the pool cannot be built or a migration fails.
pub fn create_migrated_pool(
    db_path: &str,
    settings: DbRuntimeSettings,
) -> Result<DbPool, PoolError> {
    let pool = create_pool(db_path, settings)?;
    let applied = run_migrations(&*pool.get()?)?;
    tracing::info!(path = db_path, applied, "activity log schema ready");
    Ok(pool)
}

/// Opens a single configured connection with the log schema applied.
///
/// Used by hosts that log inside their own connection instead of a pool.
///
/// # Errors
///
/// Returns `PoolError::Open` on open or pragma failure and
/// `PoolError::Migration` if a migration fails.
pub fn open_connection(db_path: &str, settings: DbRuntimeSettings) -> Result<Connection, PoolError> {
    let conn = Connection::open_with_flags(db_path, open_flags())?;
    configure(&conn, settings)?;
    run_migrations(&conn)?;
    Ok(conn)
}
