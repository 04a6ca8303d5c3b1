//! Runtime configuration for merge jobs
//!
//! Everything is read from environment variables up front; a missing or
//! malformed value fails before any storage is touched.

use chrono::NaiveDate;

use crate::domain::{parse_partition_date, DEFAULT_HASHED_EMAIL_KEY};
use crate::infra::{IdentityError, Result, RetryConfig};
use crate::merge::default_epoch_floor;

/// Storage backend selected by the database URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sqlite,
    Postgres,
}

impl BackendKind {
    pub fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("sqlite:") {
            Ok(BackendKind::Sqlite)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(BackendKind::Postgres)
        } else {
            Err(IdentityError::Configuration(format!(
                "unsupported database url scheme: {url:?} (expected sqlite: or postgres://)"
            )))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::Postgres => "postgres",
        }
    }
}

/// Merge job configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverConfig {
    /// Warehouse project; part of the job id
    pub project_id: String,
    /// Dataset holding the event and identity tables (PostgreSQL schema)
    pub dataset_id: String,
    pub database_url: String,
    pub backend: BackendKind,
    /// Maximum database connections.
    pub max_connections: u32,
    /// Parameter key carrying the hashed email
    pub hashed_email_key: String,
    /// Watermark used while the identity table is empty
    pub epoch_floor: NaiveDate,
    /// Retries of a failed write transaction
    pub write_max_retries: u32,
    pub migrate_on_startup: bool,
}

impl ResolverConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |keys: &[&str]| {
            keys.iter().find_map(|k| get(*k)).ok_or_else(|| {
                IdentityError::Configuration(format!("{} is required", keys.join(" or ")))
            })
        };

        let project_id = require(&["PROJECT_ID", "IDENTITY_PROJECT_ID"])?;
        let dataset_id = require(&["DATASET_ID", "IDENTITY_DATASET_ID"])?;
        let database_url = require(&["DATABASE_URL"])?;
        let backend = BackendKind::from_url(&database_url)?;

        let max_connections = parse_number(get("MAX_DB_CONNECTIONS"), "MAX_DB_CONNECTIONS", 10)?;
        if max_connections == 0 {
            return Err(IdentityError::Configuration(
                "MAX_DB_CONNECTIONS must be at least 1".to_string(),
            ));
        }

        let write_max_retries = parse_number(get("WRITE_MAX_RETRIES"), "WRITE_MAX_RETRIES", 5)?;

        let epoch_floor = match get("EPOCH_FLOOR") {
            Some(value) => parse_partition_date(&value).ok_or_else(|| {
                IdentityError::Configuration(format!("EPOCH_FLOOR must be YYYYMMDD, got {value:?}"))
            })?,
            None => default_epoch_floor(),
        };

        let migrate_on_startup = get("DB_MIGRATE_ON_STARTUP")
            .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "off"))
            .unwrap_or(true);

        Ok(Self {
            project_id,
            dataset_id,
            database_url,
            backend,
            max_connections,
            hashed_email_key: get("HASHED_EMAIL_PARAM")
                .unwrap_or_else(|| DEFAULT_HASHED_EMAIL_KEY.to_string()),
            epoch_floor,
            write_max_retries,
            migrate_on_startup,
        })
    }

    /// Retry policy for the persistence gateway
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::database().with_max_retries(self.write_max_retries)
    }

    /// Schema to select on PostgreSQL connections
    pub fn schema(&self) -> Option<&str> {
        match self.backend {
            BackendKind::Postgres => Some(&self.dataset_id),
            BackendKind::Sqlite => None,
        }
    }
}

fn parse_number(value: Option<String>, key: &str, default: u32) -> Result<u32> {
    match value {
        Some(v) => v.parse().map_err(|_| {
            IdentityError::Configuration(format!("{key} must be a non-negative integer, got {v:?}"))
        }),
        None => Ok(default),
    }
}
