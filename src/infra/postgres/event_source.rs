//! PostgreSQL event source
//!
//! Reads the `events` table partitioned by `event_date`. Parameter bags are
//! returned as JSON text so all parsing stays in the extractor.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgPool;

use crate::domain::{EventRecord, RawEvent};
use crate::infra::{EventSource, Result};

/// PostgreSQL-backed event partitions
#[derive(Clone)]
pub struct PgEventSource {
    pool: PgPool,
}

impl PgEventSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create from connection string
    pub async fn from_url(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
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

    /// Load events verbatim; the database still enforces date and JSON syntax
    pub async fn append_raw(&self, events: &[RawEvent]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO events (event_date, user_pseudo_id, event_params)
                VALUES (to_date($1, 'YYYYMMDD'), $2, $3::jsonb)
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
}

#[async_trait]
impl EventSource for PgEventSource {
    #[tracing::instrument(skip(self))]
    async fn scan_after(&self, watermark: Option<NaiveDate>) -> Result<Vec<RawEvent>> {
        let rows = sqlx::query_as::<_, RawEvent>(
            r#"
            SELECT to_char(event_date, 'YYYYMMDD') AS event_date,
                   user_pseudo_id,
                   event_params::text AS event_params
            FROM events
            WHERE $1::date IS NULL OR event_date > $1::date
            ORDER BY event_date ASC, id ASC
            "#,
        )
        .bind(watermark)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(events = rows.len(), "scanned event partitions");
        Ok(rows)
    }

    async fn partitions(&self) -> Result<Vec<NaiveDate>> {
        let dates: Vec<NaiveDate> =
            sqlx::query_scalar("SELECT DISTINCT event_date FROM events ORDER BY event_date ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(dates)
    }
}
