//! `PostgreSQL` storage for healwatch.
//!
//! This crate provides the production implementations of the storage
//! contracts defined elsewhere in the workspace:
//!
//! - [`PostgresEventLog`]: the append-only `events` table behind
//!   [`EventLog`](healwatch_core::event_log::EventLog)
//! - [`PostgresScanPaths`]: per-path remediation settings behind
//!   [`ScanPathSource`](healwatch_projections::ScanPathSource)
//!
//! Both share one `sqlx` connection pool. Schema lives in `migrations/` and is
//! applied with [`migrate`].
//!
//! # Example
//!
//! ```ignore
//! use healwatch_postgres::{PostgresEventLog, PostgresScanPaths, connect, migrate};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect("postgres://localhost/healwatch", 10).await?;
//!     migrate(&pool).await?;
//!     let log = PostgresEventLog::from_pool(pool.clone());
//!     let paths = PostgresScanPaths::new(pool);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod event_log;
mod scan_paths;

pub use event_log::PostgresEventLog;
pub use scan_paths::PostgresScanPaths;

use healwatch_core::event_log::EventLogError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`EventLogError::Unavailable`] if the database cannot be reached.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, EventLogError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| EventLogError::Unavailable(format!("Failed to connect: {e}")))
}

/// Apply the bundled schema migrations.
///
/// # Errors
///
/// Returns [`EventLogError::Database`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), EventLogError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| EventLogError::Database(format!("Migration failed: {e}")))
}

/// Map a driver error onto the log's error type.
///
/// Connection-level failures become `Unavailable` so readiness can tell an
/// outage apart from a bad query.
pub(crate) fn db_error(e: sqlx::Error) -> EventLogError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            EventLogError::Unavailable(e.to_string())
        }
        other => EventLogError::Database(other.to_string()),
    }
}
