//! Storage for trail activity logs.
//!
//! Hosts either share an `r2d2` pool ([`create_migrated_pool`]) or log
//! through a connection of their own ([`open_connection`]). Both run with
//! WAL journaling and a busy timeout, and both carry the `activity_logs`
//! table created by the embedded migrations.
//!
//! | Item | Purpose |
//! |------|---------|
//! | [`create_pool`] | pool with pragmas only |
//! | [`create_migrated_pool`] | pool plus schema |
//! | [`open_connection`] | single connection plus schema |
//! | [`run_migrations`] | apply pending migrations to any connection |

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{
    create_migrated_pool, create_pool, open_connection, DbPool, DbRuntimeSettings, PoolError,
};
