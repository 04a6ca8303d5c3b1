//! Identity records maintained by the merge engine

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{option_partition_date, AlternateIdType, IdentityId};

/// Canonical identity: one hashed email seen on one device.
///
/// Several records may share a `hashed_email`; that fan-out is how
/// cross-device identity is represented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: IdentityId,
    pub hashed_email: String,
    pub ga_id: String,
    /// First observation, never changed
    pub created_date: DateTime<Utc>,
    /// One entry per merge pass that touched the record, non-decreasing
    pub updated_date: Vec<DateTime<Utc>>,
    /// Latest event partition that touched the record
    #[serde(default, with = "option_partition_date")]
    pub last_event_date: Option<NaiveDate>,
}

impl IdentityRecord {
    /// Create a record on first observation of its (email, device) pair
    pub fn new(
        hashed_email: impl Into<String>,
        ga_id: impl Into<String>,
        now: DateTime<Utc>,
        event_date: NaiveDate,
    ) -> Self {
        Self {
            id: IdentityId::new(),
            hashed_email: hashed_email.into(),
            ga_id: ga_id.into(),
            created_date: now,
            updated_date: vec![now],
            last_event_date: Some(event_date),
        }
    }

    /// Most recent update timestamp
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.updated_date.last().copied()
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.hashed_email, &self.ga_id)
    }
}

/// Alternate identifiers observed for one (email, type) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateIdentityRecord {
    pub hashed_email: String,
    pub alternate_id_type: AlternateIdType,
    /// Distinct identifiers in first-seen order
    pub alternate_id: Vec<String>,
    /// One timestamp per identifier added
    pub updated_date: Vec<DateTime<Utc>>,
}

impl AlternateIdentityRecord {
    pub fn empty(hashed_email: impl Into<String>, alternate_id_type: AlternateIdType) -> Self {
        Self {
            hashed_email: hashed_email.into(),
            alternate_id_type,
            alternate_id: Vec::new(),
            updated_date: Vec::new(),
        }
    }

    pub fn contains(&self, value: &str) -> bool {
        self.alternate_id.iter().any(|v| v == value)
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.updated_date.last().copied()
    }

    pub fn key(&self) -> (&str, AlternateIdType) {
        (&self.hashed_email, self.alternate_id_type)
    }
}

/// Number of distinct devices seen with one hashed email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossDeviceSummary {
    pub hashed_email: String,
    pub device_count: u64,
}

impl CrossDeviceSummary {
    pub fn is_cross_device(&self) -> bool {
        self.device_count > 1
    }
}
