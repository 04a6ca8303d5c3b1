//! SQLite event source
//!
//! One `events` table stands in for the daily `events_YYYYMMDD` partitions;
//! `event_date` carries the partition suffix.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::SqlitePool;

use crate::domain::{format_partition_date, parse_partition_date, EventRecord, RawEvent};
use crate::infra::{EventSource, Result};

/// SQLite-backed event partitions
#[derive(Clone)]
pub struct SqliteEventSource {
    pool: SqlitePool,
}

impl SqliteEventSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create from a database path or URL
    pub async fn from_path(path: &str) -> Result<Self> {
        let pool = super::connect_sqlite(path, 1).await?;
        Ok(Self { pool })
    }

    /// Initialize the database schema
    pub async fn initialize(&self) -> Result<()> {
        crate::migrations::run_sqlite(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Load analytics events into their partitions
    pub async fn append(&self, events: &[EventRecord]) -> Result<u64> {
        let raws = events
            .iter()
            .map(EventRecord::to_raw)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.append_raw(&raws).await
    }

    /// Load events verbatim, without validating the parameter bag
    pub async fn append_raw(&self, events: &[RawEvent]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO events (event_date, user_pseudo_id, event_params)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(&event.event_date)
            .bind(event.device_id.as_deref())
            .bind(&event.event_params)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(events.len() as u64)
    }

    /// Total stored events
    pub async fn count(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }
}

#[async_trait]
impl EventSource for SqliteEventSource {
    #[tracing::instrument(skip(self))]
    async fn scan_after(&self, watermark: Option<NaiveDate>) -> Result<Vec<RawEvent>> {
        let since = watermark.map(format_partition_date);

        let rows = sqlx::query_as::<_, RawEvent>(
            r#"
            SELECT event_date, user_pseudo_id, event_params
            FROM events
            WHERE ? IS NULL OR event_date > ?
            ORDER BY event_date ASC, id ASC
            "#,
        )
        .bind(since.as_deref())
        .bind(since.as_deref())
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(events = rows.len(), "scanned event partitions");
        Ok(rows)
    }

    async fn partitions(&self) -> Result<Vec<NaiveDate>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT event_date FROM events ORDER BY event_date ASC")
                .fetch_all(&self.pool)
                .await?;

        let mut dates = Vec::with_capacity(rows.len());
        for (suffix,) in rows {
            match parse_partition_date(&suffix) {
                Some(date) => dates.push(date),
                None => tracing::warn!(partition = %suffix, "ignoring malformed partition suffix"),
            }
        }
        Ok(dates)
    }
}
