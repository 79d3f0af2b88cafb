//! Scoped activity logging for domain entities.
//!
//! Every change to a logging-enabled entity produces one canonical
//! [`LogRecord`] which is fanned out into one row per scope entry, so the
//! same event can be read back from several entities' perspectives. A
//! comment edit, for example, is visible under the comment, its article and
//! its author. All rows of one event are written inside a single savepoint:
//! either every row is stored or none is.
//!
//! # Pipeline
//!
//! | Stage | Item |
//! |-------|------|
//! | identity resolution | [`Repositories::resolve`] |
//! | scope configuration | [`ScopeRegistry`] |
//! | record construction | [`LogRecord::build`] |
//! | fan-out | [`expand`] |
//! | persistence | [`LogStore::save_atomic`] |
//! | host glue | [`ActivityLogger`], [`LifecycleHooks`] |
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use trail_activity::{ActivityLogger, LifecycleHooks, Repositories, ScopeMember, TableName};
//!
//! let repos = Arc::new(
//!     Repositories::new()
//!         .with("Comments", "id")
//!         .with("Articles", "id")
//!         .with("Users", "id"),
//! );
//! let mut comments = ActivityLogger::new(
//!     conn,
//!     repos,
//!     "Comments",
//!     TableName::default(),
//!     &["Comments".into(), "Articles".into()],
//! );
//! comments
//!     .set_scope(&["Comments".into(), ScopeMember::from(&article)])
//!     .set_issuer(Arc::new(user));
//!
//! comments.on_after_save(&comment, false, &["body"])?;
//! let history = comments.find_activity(Some(&article))?;
//! ```

mod config;
mod entity;
mod error;
mod fanout;
mod identity;
mod logger;
mod record;
mod scope;
mod store;

pub use config::{
    load_config, Config, ConfigError, DatabaseConfig, LoggerConfig, LoggerEntry, LoggerSettings,
    LoggingConfig,
};
pub use entity::{dirty_snapshot, full_snapshot, Entity, EntityId, EntityRecord};
pub use error::{ActivityError, BoxError, InvalidTableName, PersistError};
pub use fanout::expand;
pub use identity::{Identity, Repositories, RepositoryInfo};
pub use logger::{ActivityLogger, LifecycleHooks, LogContext};
pub use record::{
    Action, ActivityLog, Level, LogRecord, MessageBuilder, MessageContext, ParseTagError,
    ScopedLogRecord,
};
pub use scope::{Scope, ScopeMember, ScopeRegistry};
pub use store::{
    create_log_table, find_logs, save_atomic, ActivityFilter, LogStore, TableName,
    DEFAULT_LOG_TABLE,
};

#[cfg(test)]
mod tests;
