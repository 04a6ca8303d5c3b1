//! Core type definitions for identity resolution
//!
//! Identifier newtypes, the closed set of alternate-ID tags, and the
//! partition date format used by the analytics export.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Partition date format used by the export (`events_YYYYMMDD`)
pub const PARTITION_DATE_FORMAT: &str = "%Y%m%d";

/// Parameter key carrying the hashed email in the event parameter bag
pub const DEFAULT_HASHED_EMAIL_KEY: &str = "guid_email";

/// Parse a `YYYYMMDD` partition suffix
pub fn parse_partition_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.len() != 8 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(value, PARTITION_DATE_FORMAT).ok()
}

/// Render a date as a `YYYYMMDD` partition suffix
pub fn format_partition_date(date: NaiveDate) -> String {
    date.format(PARTITION_DATE_FORMAT).to_string()
}

/// Serde module for dates stored as `YYYYMMDD` strings
pub mod partition_date {
    use chrono::NaiveDate;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_partition_date(*date))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_partition_date(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("expected YYYYMMDD date, got {s:?}")))
    }
}

/// Serde module for optional `YYYYMMDD` dates
pub mod option_partition_date {
    use chrono::NaiveDate;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(opt: &Option<NaiveDate>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match opt {
            Some(date) => serializer.serialize_some(&super::format_partition_date(*date)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => super::parse_partition_date(&s).map(Some).ok_or_else(|| {
                serde::de::Error::custom(format!("expected YYYYMMDD date, got {s:?}"))
            }),
            None => Ok(None),
        }
    }
}

/// Identity record identifier (generated once, never reassigned)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub uuid::Uuid);

impl IdentityId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Default for IdentityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Third-party identifier tags recognised in the parameter bag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlternateIdType {
    #[serde(rename = "fb_id")]
    Facebook,
    #[serde(rename = "tiktok_id")]
    TikTok,
    #[serde(rename = "reddit_id")]
    Reddit,
    #[serde(rename = "gads_id")]
    GoogleAds,
    #[serde(rename = "floodlight_id")]
    Floodlight,
}

impl AlternateIdType {
    pub const ALL: [AlternateIdType; 5] = [
        AlternateIdType::Facebook,
        AlternateIdType::TikTok,
        AlternateIdType::Reddit,
        AlternateIdType::GoogleAds,
        AlternateIdType::Floodlight,
    ];

    /// Parameter key (and stored tag) for this type
    pub fn as_str(&self) -> &'static str {
        match self {
            AlternateIdType::Facebook => "fb_id",
            AlternateIdType::TikTok => "tiktok_id",
            AlternateIdType::Reddit => "reddit_id",
            AlternateIdType::GoogleAds => "gads_id",
            AlternateIdType::Floodlight => "floodlight_id",
        }
    }

    /// Match a parameter key against the known tags
    pub fn from_param_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == key)
    }
}

impl fmt::Display for AlternateIdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlternateIdType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_param_key(s).ok_or_else(|| format!("unknown alternate id type: {s}"))
    }
}

/// How the merge watermark was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkSource {
    /// Supplied by the caller
    Explicit,
    /// Date of the latest `updated_date` entry in the identity table
    Derived,
    /// Identity table empty; configured floor used
    EpochFloor,
}

/// Exclusive lower bound on event partitions for a merge pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    #[serde(with = "partition_date")]
    pub date: NaiveDate,
    pub source: WatermarkSource,
}

impl Watermark {
    pub fn explicit(date: NaiveDate) -> Self {
        Self {
            date,
            source: WatermarkSource::Explicit,
        }
    }

    pub fn derived(date: NaiveDate) -> Self {
        Self {
            date,
            source: WatermarkSource::Derived,
        }
    }

    pub fn epoch_floor(date: NaiveDate) -> Self {
        Self {
            date,
            source: WatermarkSource::EpochFloor,
        }
    }

    /// Whether an event partition falls inside the window
    pub fn admits(&self, event_date: NaiveDate) -> bool {
        event_date > self.date
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_partition_date(self.date))
    }
}
