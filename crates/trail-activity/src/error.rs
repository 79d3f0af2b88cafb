//! Error types for activity logging.

/// Boxed error returned by host-supplied hooks such as message builders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while writing or reading log rows.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// A database operation failed. The batch was rolled back.
    #[error("activity log database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The `data` payload could not be serialised or deserialised.
    #[error("activity log serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No pooled connection could be checked out.
    #[error("activity log pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

/// A log store target that is not a plain SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid log table name: {0:?}")]
pub struct InvalidTableName(pub String);

/// Errors surfaced to lifecycle hooks and manual `log` callers.
#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    /// Persisting the scoped rows failed.
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// The registered message builder returned an error.
    #[error("message builder failed: {0}")]
    MessageBuilder(#[source] BoxError),
}
