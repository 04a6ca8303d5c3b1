//! SQLite implementations for local merge runs and tests
//!
//! Repeated fields (`updated_date`, `alternate_id`) are stored as JSON arrays
//! and timestamps as RFC 3339 text with microsecond precision.

mod event_source;
mod identity_store;

pub use event_source::*;
pub use identity_store::*;

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::infra::{IdentityError, Result};

/// Open a SQLite pool, creating the database file if needed.
///
/// In-memory databases are per-connection, so they get a single connection.
pub async fn connect_sqlite(url: &str, max_connections: u32) -> Result<SqlitePool> {
    let in_memory = url.contains(":memory:") || url.contains("mode=memory");
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { max_connections.max(1) })
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub(crate) fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_timestamp(table: &'static str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| IdentityError::corrupt_row(table, format!("invalid timestamp {value:?}: {e}")))
}

pub(crate) fn encode_timestamps(timestamps: &[DateTime<Utc>]) -> Result<String> {
    let encoded: Vec<String> = timestamps.iter().map(encode_timestamp).collect();
    Ok(serde_json::to_string(&encoded)?)
}

pub(crate) fn decode_timestamps(table: &'static str, value: &str) -> Result<Vec<DateTime<Utc>>> {
    let raw: Vec<String> = serde_json::from_str(value).map_err(|e| {
        IdentityError::corrupt_row(table, format!("invalid timestamp array: {e}"))
    })?;
    raw.iter().map(|s| decode_timestamp(table, s)).collect()
}
