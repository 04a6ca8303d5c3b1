//! SQLite identity store
//!
//! Reads identity snapshots and applies merge batches to `identity_match`
//! and `alternate_identity_match`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, FromRow, Sqlite, Transaction};
use uuid::Uuid;

use super::{decode_timestamp, decode_timestamps, encode_timestamp, encode_timestamps};
use crate::domain::{
    format_partition_date, parse_partition_date, AlternateIdType, AlternateIdentityRecord,
    CrossDeviceSummary, IdentityId, IdentityRecord,
};
use crate::infra::{
    IdentityError, IdentityStore, PersistenceGateway, Result, Retry, RetryConfig,
};

/// SQLite's default bound-parameter limit is well above this
const EMAIL_CHUNK_SIZE: usize = 500;

const IDENTITY_TABLE: &str = "identity_match";
const ALTERNATE_TABLE: &str = "alternate_identity_match";

/// SQLite-backed identity tables
#[derive(Clone)]
pub struct SqliteIdentityStore {
    pool: SqlitePool,
    retry: RetryConfig,
}

impl SqliteIdentityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry: RetryConfig::fast(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Initialize the database schema
    pub async fn initialize(&self) -> Result<()> {
        crate::migrations::run_sqlite(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Total identity records
    pub async fn identity_count(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM identity_match")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    /// Total alternate identity records
    pub async fn alternate_count(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM alternate_identity_match")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    /// Every alternate identity record, ordered by key
    pub async fn all_alternates(&self) -> Result<Vec<AlternateIdentityRecord>> {
        let rows = sqlx::query_as::<_, AlternateRow>(
            r#"
            SELECT hashed_email, alternate_id_type, alternate_id, updated_date
            FROM alternate_identity_match
            ORDER BY hashed_email ASC, alternate_id_type ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AlternateIdentityRecord::try_from).collect()
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
    tx: &mut Transaction<'_, Sqlite>,
    identity: &IdentityRecord,
) -> Result<()> {
    let last_updated = identity.last_updated().unwrap_or(identity.created_date);

    sqlx::query(
        r#"
        INSERT INTO identity_match (
            id, hashed_email, ga_id, created_date,
            updated_date, last_updated_at, last_event_date
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(hashed_email, ga_id) DO UPDATE SET
            updated_date = excluded.updated_date,
            last_updated_at = excluded.last_updated_at,
            last_event_date = excluded.last_event_date
        "#,
    )
    .bind(identity.id.0.to_string())
    .bind(&identity.hashed_email)
    .bind(&identity.ga_id)
    .bind(encode_timestamp(&identity.created_date))
    .bind(encode_timestamps(&identity.updated_date)?)
    .bind(encode_timestamp(&last_updated))
    .bind(identity.last_event_date.map(format_partition_date))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn upsert_alternate(
    tx: &mut Transaction<'_, Sqlite>,
    alternate: &AlternateIdentityRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO alternate_identity_match (
            hashed_email, alternate_id_type, alternate_id, updated_date
        ) VALUES (?, ?, ?, ?)
        ON CONFLICT(hashed_email, alternate_id_type) DO UPDATE SET
            alternate_id = excluded.alternate_id,
            updated_date = excluded.updated_date
        "#,
    )
    .bind(&alternate.hashed_email)
    .bind(alternate.alternate_id_type.as_str())
    .bind(serde_json::to_string(&alternate.alternate_id)?)
    .bind(encode_timestamps(&alternate.updated_date)?)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn latest_update(&self) -> Result<Option<DateTime<Utc>>> {
        let row: (Option<String>,) =
            sqlx::query_as("SELECT MAX(last_updated_at) FROM identity_match")
                .fetch_one(&self.pool)
                .await?;

        row.0
            .map(|s| decode_timestamp(IDENTITY_TABLE, &s))
            .transpose()
    }

    #[tracing::instrument(skip(self, emails), fields(emails = emails.len()))]
    async fn identities_for_emails(&self, emails: &[String]) -> Result<Vec<IdentityRecord>> {
        let mut records = Vec::new();

        for chunk in emails.chunks(EMAIL_CHUNK_SIZE) {
            let query = format!(
                r#"
                SELECT id, hashed_email, ga_id, created_date, updated_date, last_event_date
                FROM identity_match
                WHERE hashed_email IN ({})
                ORDER BY hashed_email ASC, created_date ASC, ga_id ASC
                "#,
                placeholders(chunk.len())
            );

            let mut q = sqlx::query_as::<_, IdentityRow>(&query);
            for email in chunk {
                q = q.bind(email);
            }

            for row in q.fetch_all(&self.pool).await? {
                records.push(IdentityRecord::try_from(row)?);
            }
        }

        Ok(records)
    }

    #[tracing::instrument(skip(self, emails), fields(emails = emails.len()))]
    async fn alternates_for_emails(
        &self,
        emails: &[String],
    ) -> Result<Vec<AlternateIdentityRecord>> {
        let mut records = Vec::new();

        for chunk in emails.chunks(EMAIL_CHUNK_SIZE) {
            let query = format!(
                r#"
                SELECT hashed_email, alternate_id_type, alternate_id, updated_date
                FROM alternate_identity_match
                WHERE hashed_email IN ({})
                ORDER BY hashed_email ASC, alternate_id_type ASC
                "#,
                placeholders(chunk.len())
            );

            let mut q = sqlx::query_as::<_, AlternateRow>(&query);
            for email in chunk {
                q = q.bind(email);
            }

            for row in q.fetch_all(&self.pool).await? {
                records.push(AlternateIdentityRecord::try_from(row)?);
            }
        }

        Ok(records)
    }

    async fn identities_for_email(&self, hashed_email: &str) -> Result<Vec<IdentityRecord>> {
        let rows = sqlx::query_as::<_, IdentityRow>(
            r#"
            SELECT id, hashed_email, ga_id, created_date, updated_date, last_event_date
            FROM identity_match
            WHERE hashed_email = ?
            ORDER BY created_date ASC, ga_id ASC
            "#,
        )
        .bind(hashed_email)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IdentityRecord::try_from).collect()
    }

    async fn cross_device_summary(&self, min_devices: u64) -> Result<Vec<CrossDeviceSummary>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT hashed_email, COUNT(DISTINCT ga_id) AS device_count
            FROM identity_match
            GROUP BY hashed_email
            HAVING COUNT(DISTINCT ga_id) >= ?
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
impl PersistenceGateway for SqliteIdentityStore {
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
                "sqlite.apply_merge",
                || self.apply_once(identities, alternates),
                IdentityError::is_retryable,
            )
            .await
    }
}

/// Raw row from identity_match
#[derive(Debug, FromRow)]
struct IdentityRow {
    id: String,
    hashed_email: String,
    ga_id: String,
    created_date: String,
    updated_date: String,
    last_event_date: Option<String>,
}

impl TryFrom<IdentityRow> for IdentityRecord {
    type Error = IdentityError;

    fn try_from(row: IdentityRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| IdentityError::corrupt_row(IDENTITY_TABLE, format!("invalid id: {e}")))?;

        let last_event_date = row
            .last_event_date
            .map(|s| {
                parse_partition_date(&s).ok_or_else(|| {
                    IdentityError::corrupt_row(
                        IDENTITY_TABLE,
                        format!("invalid last_event_date {s:?}"),
                    )
                })
            })
            .transpose()?;

        Ok(IdentityRecord {
            id: IdentityId::from_uuid(id),
            hashed_email: row.hashed_email,
            ga_id: row.ga_id,
            created_date: decode_timestamp(IDENTITY_TABLE, &row.created_date)?,
            updated_date: decode_timestamps(IDENTITY_TABLE, &row.updated_date)?,
            last_event_date,
        })
    }
}

/// Raw row from alternate_identity_match
#[derive(Debug, FromRow)]
struct AlternateRow {
    hashed_email: String,
    alternate_id_type: String,
    alternate_id: String,
    updated_date: String,
}

impl TryFrom<AlternateRow> for AlternateIdentityRecord {
    type Error = IdentityError;

    fn try_from(row: AlternateRow) -> Result<Self> {
        let alternate_id_type: AlternateIdType = row
            .alternate_id_type
            .parse()
            .map_err(|e: String| IdentityError::corrupt_row(ALTERNATE_TABLE, e))?;

        let alternate_id: Vec<String> = serde_json::from_str(&row.alternate_id).map_err(|e| {
            IdentityError::corrupt_row(ALTERNATE_TABLE, format!("invalid alternate_id: {e}"))
        })?;

        Ok(AlternateIdentityRecord {
            hashed_email: row.hashed_email,
            alternate_id_type,
            alternate_id,
            updated_date: decode_timestamps(ALTERNATE_TABLE, &row.updated_date)?,
        })
    }
}
