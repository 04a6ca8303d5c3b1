//! Infrastructure layer for identity resolution
//!
//! Contains trait definitions and implementations for:
//! - Event partitions (PostgreSQL, SQLite)
//! - Identity snapshots and the persistence gateway (PostgreSQL, SQLite)
//! - Bounded retry for transient storage failures

mod error;
pub mod postgres;
mod retry;
pub mod sqlite;
mod traits;

pub use error::*;
pub use postgres::{connect_postgres, PgEventSource, PgIdentityStore};
pub use retry::{is_retryable_db_error, Retry, RetryConfig};
pub use sqlite::{connect_sqlite, SqliteEventSource, SqliteIdentityStore};
pub use traits::*;
