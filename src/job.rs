//! Merge job entry point
//!
//! What an external trigger calls: parse the optional watermark argument,
//! connect the configured backend, run one merge pass and report back.

use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{error, info, Instrument};
use uuid::Uuid;

use crate::config::{BackendKind, ResolverConfig};
use crate::domain::{parse_partition_date, EventRecord, MergeReport};
use crate::infra::{
    connect_postgres, connect_sqlite, EventSource, IdentityError, IdentityStore, PgEventSource,
    PgIdentityStore, Result, SqliteEventSource, SqliteIdentityStore,
};
use crate::merge::{EventExtractor, IdentityMergeEngine};
use crate::telemetry::spans;

/// Connected storage for one backend
#[derive(Clone)]
pub enum Backend {
    Sqlite {
        events: SqliteEventSource,
        store: SqliteIdentityStore,
    },
    Postgres {
        events: PgEventSource,
        store: PgIdentityStore,
    },
}

impl Backend {
    /// Open a pool for the configured database
    pub async fn connect(config: &ResolverConfig) -> Result<Self> {
        let backend = match config.backend {
            BackendKind::Sqlite => {
                let pool = connect_sqlite(&config.database_url, config.max_connections).await?;
                Backend::Sqlite {
                    events: SqliteEventSource::new(pool.clone()),
                    store: SqliteIdentityStore::new(pool).with_retry(config.retry_config()),
                }
            }
            BackendKind::Postgres => {
                let pool = connect_postgres(
                    &config.database_url,
                    config.max_connections,
                    config.schema(),
                )
                .await?;
                Backend::Postgres {
                    events: PgEventSource::new(pool.clone()),
                    store: PgIdentityStore::new(pool).with_retry(config.retry_config()),
                }
            }
        };
        Ok(backend)
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Sqlite { .. } => BackendKind::Sqlite,
            Backend::Postgres { .. } => BackendKind::Postgres,
        }
    }

    /// Apply embedded schema migrations
    pub async fn migrate(&self) -> Result<()> {
        match self {
            Backend::Sqlite { store, .. } => crate::migrations::run_sqlite(store.pool()).await,
            Backend::Postgres { store, .. } => crate::migrations::run_postgres(store.pool()).await,
        }
    }

    pub fn event_source(&self) -> Arc<dyn EventSource> {
        match self {
            Backend::Sqlite { events, .. } => Arc::new(events.clone()),
            Backend::Postgres { events, .. } => Arc::new(events.clone()),
        }
    }

    pub fn identity_store(&self) -> Arc<dyn IdentityStore> {
        match self {
            Backend::Sqlite { store, .. } => Arc::new(store.clone()),
            Backend::Postgres { store, .. } => Arc::new(store.clone()),
        }
    }

    /// Merge engine over this backend
    pub fn engine(&self, config: &ResolverConfig) -> IdentityMergeEngine {
        let engine = match self {
            Backend::Sqlite { events, store } => IdentityMergeEngine::new(
                Arc::new(events.clone()),
                Arc::new(store.clone()),
                Arc::new(store.clone()),
            ),
            Backend::Postgres { events, store } => IdentityMergeEngine::new(
                Arc::new(events.clone()),
                Arc::new(store.clone()),
                Arc::new(store.clone()),
            ),
        };
        engine
            .with_extractor(EventExtractor::new(config.hashed_email_key.clone()))
            .with_epoch_floor(config.epoch_floor)
    }

    /// Load exported events into the event partitions
    pub async fn load_events(&self, events: &[EventRecord]) -> Result<u64> {
        let span = tracing::info_span!(spans::LOAD_EVENTS, events = events.len());
        async {
            match self {
                Backend::Sqlite { events: source, .. } => source.append(events).await,
                Backend::Postgres { events: source, .. } => source.append(events).await,
            }
        }
        .instrument(span)
        .await
    }
}

/// Parse the trigger's watermark argument.
///
/// Absent, blank or `NULL` means "derive automatically".
pub fn parse_trigger_watermark(value: Option<&str>) -> Result<Option<NaiveDate>> {
    let Some(value) = value.map(str::trim) else {
        return Ok(None);
    };
    if value.is_empty() || value.eq_ignore_ascii_case("null") {
        return Ok(None);
    }

    parse_partition_date(value).map(Some).ok_or_else(|| {
        IdentityError::InvalidWatermark(format!("expected YYYYMMDD, got {value:?}"))
    })
}

/// Result of one triggered merge job
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    /// `<project_id>:<dataset_id>.<run_uuid>`
    pub job_id: String,
    pub report: MergeReport,
}

impl JobOutcome {
    /// Status line returned to the trigger
    pub fn status(&self) -> String {
        format!("Job: {} has completed. {}", self.job_id, self.report.status())
    }
}

/// Connect, migrate if configured, and run one merge pass
pub async fn run_merge_job(
    config: &ResolverConfig,
    since: Option<NaiveDate>,
) -> Result<JobOutcome> {
    let backend = Backend::connect(config).await?;
    if config.migrate_on_startup {
        backend.migrate().await?;
    }
    execute_merge_job(&backend, config, since).await
}

/// Run one merge pass on an already connected backend
pub async fn execute_merge_job(
    backend: &Backend,
    config: &ResolverConfig,
    since: Option<NaiveDate>,
) -> Result<JobOutcome> {
    let job_id = format!(
        "{}:{}.{}",
        config.project_id,
        config.dataset_id,
        Uuid::new_v4()
    );
    let span = tracing::info_span!(
        spans::MERGE_JOB,
        job_id = %job_id,
        backend = backend.kind().as_str()
    );

    async {
        let engine = backend.engine(config);
        match engine.merge(since).await {
            Ok(report) => {
                let outcome = JobOutcome {
                    job_id: job_id.clone(),
                    report,
                };
                info!(status = %outcome.status(), "merge job completed");
                Ok(outcome)
            }
            Err(e) => {
                match &e {
                    IdentityError::MergeFailed {
                        watermark,
                        events_scanned,
                        ..
                    } => error!(
                        watermark = %watermark,
                        events_scanned = *events_scanned,
                        error = %e,
                        "merge job failed"
                    ),
                    _ => error!(
                        requested_watermark = ?since,
                        error = %e,
                        "merge job failed before scanning events"
                    ),
                }
                Err(e)
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AlternateIdType;

    fn sqlite_config() -> ResolverConfig {
        ResolverConfig::from_lookup(|key| match key {
            "PROJECT_ID" => Some("acme".to_string()),
            "DATASET_ID" => Some("analytics_123".to_string()),
            "DATABASE_URL" => Some("sqlite::memory:".to_string()),
            _ => None,
        })
        .unwrap()
    }

    #[test]
    fn test_parse_trigger_watermark() {
        assert_eq!(parse_trigger_watermark(None).unwrap(), None);
        assert_eq!(parse_trigger_watermark(Some("")).unwrap(), None);
        assert_eq!(parse_trigger_watermark(Some(" NULL ")).unwrap(), None);
        assert_eq!(parse_trigger_watermark(Some("null")).unwrap(), None);
        assert_eq!(
            parse_trigger_watermark(Some("20250606")).unwrap(),
            NaiveDate::from_ymd_opt(2025, 6, 6)
        );

        for bad in ["2025-06-06", "yesterday", "20251301"] {
            assert!(matches!(
                parse_trigger_watermark(Some(bad)),
                Err(IdentityError::InvalidWatermark(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_execute_merge_job_on_sqlite() {
        let config = sqlite_config();
        let backend = Backend::connect(&config).await.unwrap();
        backend.migrate().await.unwrap();
        assert_eq!(backend.kind(), BackendKind::Sqlite);

        let day = NaiveDate::from_ymd_opt(2025, 6, 6).unwrap();
        backend
            .load_events(&[
                EventRecord::new(day, "D1")
                    .with_param("guid_email", "H1")
                    .with_alternate_id(AlternateIdType::Facebook, "F1"),
                EventRecord::new(day, "D2").with_param("guid_email", "H1"),
            ])
            .await
            .unwrap();

        let outcome = execute_merge_job(&backend, &config, None).await.unwrap();
        assert!(outcome.job_id.starts_with("acme:analytics_123."));
        assert_eq!(outcome.report.identities_inserted, 2);

        let status = outcome.status();
        assert!(status.starts_with(&format!("Job: {} has completed", outcome.job_id)));
        assert!(status.contains("Processing completed"));

        let identities = backend.identity_store().identities_for_email("H1").await.unwrap();
        assert_eq!(identities.len(), 2);
    }

    #[tokio::test]
    async fn test_run_merge_job_with_empty_store() {
        let outcome = run_merge_job(&sqlite_config(), None).await.unwrap();
        assert!(outcome.report.is_noop());
        assert_eq!(outcome.report.events_scanned, 0);
    }
}
