//! PostgreSQL identity store

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{postgres::PgPool, FromRow, Postgres, Transaction};
use uuid::Uuid;

use crate::domain::{
    AlternateIdType, AlternateIdentityRecord, CrossDeviceSummary, IdentityId, IdentityRecord,
};
use crate::infra::{
    IdentityError, IdentityStore, PersistenceGateway, Result, Retry, RetryConfig,
};

/// PostgreSQL-backed identity tables
#[derive(Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
    retry: RetryConfig,
}

impl PgIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryConfig::database(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn apply_once(
        &self,
        identities: &[IdentityRecord],
        alternates: &[AlternateIdentityRecord],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for identity in identities {
            upsert_identity(&mut tx, identity).await?;
        }
        for alternate in alternates {
            upsert_alternate(&mut tx, alternate).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

async fn upsert_identity(
    tx: &mut Transaction<'_, Postgres>,
    identity: &IdentityRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO identity_match (
            id, hashed_email, ga_id, created_date, updated_date, last_event_date
        ) VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT ON CONSTRAINT identity_match_email_ga_id_key DO UPDATE SET
            updated_date = EXCLUDED.updated_date,
            last_event_date = EXCLUDED.last_event_date
        "#,
    )
    .bind(identity.id.0)
    .bind(&identity.hashed_email)
    .bind(&identity.ga_id)
    .bind(identity.created_date)
    .bind(&identity.updated_date)
    .bind(identity.last_event_date)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn upsert_alternate(
    tx: &mut Transaction<'_, Postgres>,
    alternate: &AlternateIdentityRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO alternate_identity_match (
            hashed_email, alternate_id_type, alternate_id, updated_date
        ) VALUES ($1, $2, $3, $4)
        ON CONFLICT (hashed_email, alternate_id_type) DO UPDATE SET
            alternate_id = EXCLUDED.alternate_id,
            updated_date = EXCLUDED.updated_date
        "#,
    )
    .bind(&alternate.hashed_email)
    .bind(alternate.alternate_id_type.as_str())
    .bind(&alternate.alternate_id)
    .bind(&alternate.updated_date)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn latest_update(&self) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(updated_date[array_upper(updated_date, 1)]) FROM identity_match",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    #[tracing::instrument(skip(self, emails), fields(emails = emails.len()))]
    async fn identities_for_emails(&self, emails: &[String]) -> Result<Vec<IdentityRecord>> {
        if emails.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, IdentityRow>(
            r#"
            SELECT id, hashed_email, ga_id, created_date, updated_date, last_event_date
            FROM identity_match
            WHERE hashed_email = ANY($1)
            ORDER BY hashed_email ASC, created_date ASC, ga_id ASC
            "#,
        )
        .bind(emails)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(IdentityRecord::from).collect())
    }

    #[tracing::instrument(skip(self, emails), fields(emails = emails.len()))]
    async fn alternates_for_emails(
        &self,
        emails: &[String],
    ) -> Result<Vec<AlternateIdentityRecord>> {
        if emails.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, AlternateRow>(
            r#"
            SELECT hashed_email, alternate_id_type, alternate_id, updated_date
            FROM alternate_identity_match
            WHERE hashed_email = ANY($1)
            ORDER BY hashed_email ASC, alternate_id_type ASC
            "#,
        )
        .bind(emails)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AlternateIdentityRecord::try_from).collect()
    }

    async fn identities_for_email(&self, hashed_email: &str) -> Result<Vec<IdentityRecord>> {
        let rows = sqlx::query_as::<_, IdentityRow>(
            r#"
            SELECT id, hashed_email, ga_id, created_date, updated_date, last_event_date
            FROM identity_match
            WHERE hashed_email = $1
            ORDER BY created_date ASC, ga_id ASC
            "#,
        )
        .bind(hashed_email)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(IdentityRecord::from).collect())
    }

    async fn cross_device_summary(&self, min_devices: u64) -> Result<Vec<CrossDeviceSummary>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT hashed_email, COUNT(DISTINCT ga_id) AS device_count
            FROM identity_match
            GROUP BY hashed_email
            HAVING COUNT(DISTINCT ga_id) >= $1
            ORDER BY device_count DESC, hashed_email ASC
            "#,
        )
        .bind(i64::try_from(min_devices).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(hashed_email, count)| CrossDeviceSummary {
                hashed_email,
                device_count: count as u64,
            })
            .collect())
    }
}

#[async_trait]
impl PersistenceGateway for PgIdentityStore {
    #[tracing::instrument(
        skip(self, identities, alternates),
        fields(identities = identities.len(), alternates = alternates.len())
    )]
    async fn apply(
        &self,
        identities: &[IdentityRecord],
        alternates: &[AlternateIdentityRecord],
    ) -> Result<()> {
        if identities.is_empty() && alternates.is_empty() {
            return Ok(());
        }

        Retry::new(self.retry.clone())
            .run(
                "postgres.apply_merge",
                || self.apply_once(identities, alternates),
                IdentityError::is_retryable,
            )
            .await
    }
}

#[derive(Debug, FromRow)]
struct IdentityRow {
    id: Uuid,
    hashed_email: String,
    ga_id: String,
    created_date: DateTime<Utc>,
    updated_date: Vec<DateTime<Utc>>,
    last_event_date: Option<NaiveDate>,
}

impl From<IdentityRow> for IdentityRecord {
    fn from(row: IdentityRow) -> Self {
        IdentityRecord {
            id: IdentityId::from_uuid(row.id),
            hashed_email: row.hashed_email,
            ga_id: row.ga_id,
            created_date: row.created_date,
            updated_date: row.updated_date,
            last_event_date: row.last_event_date,
        }
    }
}

#[derive(Debug, FromRow)]
struct AlternateRow {
    hashed_email: String,
    alternate_id_type: String,
    alternate_id: Vec<String>,
    updated_date: Vec<DateTime<Utc>>,
}

impl TryFrom<AlternateRow> for AlternateIdentityRecord {
    type Error = IdentityError;

    fn try_from(row: AlternateRow) -> Result<Self> {
        let alternate_id_type: AlternateIdType = row
            .alternate_id_type
            .parse()
            .map_err(|e: String| IdentityError::corrupt_row("alternate_identity_match", e))?;

        Ok(AlternateIdentityRecord {
            hashed_email: row.hashed_email,
            alternate_id_type,
            alternate_id: row.alternate_id,
            updated_date: row.updated_date,
        })
    }
}
