//! Trait definitions for the identity resolution storage seams

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
#[cfg(test)]
use mockall::automock;

use crate::domain::{AlternateIdentityRecord, CrossDeviceSummary, IdentityRecord, RawEvent};

use super::Result;

/// Date-partitioned store of raw analytics events.
///
/// Invariant: events are append-only; nothing here mutates them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Raw events in partitions strictly after `watermark`
    ///
    /// `None` scans from the beginning of time. Results are ordered by
    /// partition date, then load order.
    async fn scan_after(&self, watermark: Option<NaiveDate>) -> Result<Vec<RawEvent>>;

    /// Partition dates currently present, ascending
    async fn partitions(&self) -> Result<Vec<NaiveDate>>;
}

/// Read side of the identity and alternate-identity tables
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Latest `updated_date` entry across all identity records
    async fn latest_update(&self) -> Result<Option<DateTime<Utc>>>;

    /// Identity records for the given hashed emails
    async fn identities_for_emails(&self, emails: &[String]) -> Result<Vec<IdentityRecord>>;

    /// Alternate identity records for the given hashed emails
    async fn alternates_for_emails(&self, emails: &[String])
        -> Result<Vec<AlternateIdentityRecord>>;

    /// All identity records for one hashed email, oldest first
    async fn identities_for_email(&self, hashed_email: &str) -> Result<Vec<IdentityRecord>>;

    /// Device fan-out per hashed email, computed at query time
    ///
    /// Only emails seen with at least `min_devices` distinct devices are returned.
    async fn cross_device_summary(&self, min_devices: u64) -> Result<Vec<CrossDeviceSummary>>;
}

/// Write side: applies a merge pass's computed rows.
///
/// Invariant: the whole batch commits or nothing does.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Upsert identities by (hashed_email, ga_id) and alternates by
    /// (hashed_email, alternate_id_type) in one transaction
    async fn apply(
        &self,
        identities: &[IdentityRecord],
        alternates: &[AlternateIdentityRecord],
    ) -> Result<()>;
}
