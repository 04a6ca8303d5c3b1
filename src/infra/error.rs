//! Error types for identity resolution

use chrono::NaiveDate;
use thiserror::Error;

use super::retry::is_retryable_db_error;

/// Errors that can occur while resolving identities
#[derive(Error, Debug)]
pub enum IdentityError {
    /// Storage read/write or transaction failure
    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// Schema migration failure
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Missing or invalid startup configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Watermark argument not in `YYYYMMDD` form
    #[error("invalid watermark: {0}")]
    InvalidWatermark(String),

    /// JSON encoding/decoding failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored row could not be decoded
    #[error("corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },

    /// A merge pass failed after its watermark was resolved
    #[error(
        "merge failed at watermark {watermark} after scanning {events_scanned} events: {source}"
    )]
    MergeFailed {
        watermark: NaiveDate,
        events_scanned: usize,
        #[source]
        source: Box<IdentityError>,
    },

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl IdentityError {
    pub fn corrupt_row(table: &'static str, message: impl Into<String>) -> Self {
        IdentityError::CorruptRow {
            table,
            message: message.into(),
        }
    }

    /// Whether the failure is transient and the write may be replayed
    pub fn is_retryable(&self) -> bool {
        match self {
            IdentityError::Persistence(err) => is_retryable_db_error(err),
            IdentityError::MergeFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Result type for identity resolution operations
pub type Result<T> = std::result::Result<T, IdentityError>;

/// Reasons a single event cannot be turned into an identity signal.
///
/// These never fail a merge pass; the event is skipped and counted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    /// Parameter bag is not a JSON array of key/value entries
    #[error("malformed parameter bag: {0}")]
    MalformedParameters(String),

    /// Partition date is not `YYYYMMDD`
    #[error("invalid event date: {0:?}")]
    InvalidEventDate(String),

    /// Event carries no device identifier
    #[error("missing device identifier")]
    MissingDeviceId,

    /// Parameter entry with an empty key
    #[error("parameter with empty key")]
    EmptyParameterKey,

    /// Two different hashed emails in one event
    #[error("conflicting hashed emails in one event: {first} / {second}")]
    ConflictingHashedEmail { first: String, second: String },
}
