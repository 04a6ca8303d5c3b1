//! Analytics event records and the identity signals extracted from them
//!
//! `EventRecord` mirrors one row of the daily analytics export. `RawEvent` is
//! the storage-level form handed to the extractor, with the parameter bag still
//! serialized. `IdentitySignal` is what the extractor produces.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{format_partition_date, partition_date, AlternateIdType};

/// Typed value slot of an event parameter
///
/// Exactly one field is normally populated, but the export does not
/// guarantee it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub float_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub double_value: Option<f64>,
}

impl ParamValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            string_value: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn int(value: i64) -> Self {
        Self {
            int_value: Some(value),
            ..Default::default()
        }
    }

    /// Value usable as an identifier: a non-blank string, else an integer
    pub fn as_identifier(&self) -> Option<String> {
        if let Some(s) = self.string_value.as_deref().map(str::trim) {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
        self.int_value.map(|v| v.to_string())
    }
}

/// One key/value entry of the parameter bag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventParam {
    pub key: String,
    #[serde(default)]
    pub value: ParamValue,
}

impl EventParam {
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: ParamValue::string(value),
        }
    }
}

/// One analytics event from the daily export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Partition key
    #[serde(with = "partition_date")]
    pub event_date: NaiveDate,

    /// Pseudo-anonymous device identifier
    #[serde(rename = "user_pseudo_id")]
    pub device_id: String,

    /// Unordered parameter bag
    #[serde(rename = "event_params", default)]
    pub parameters: Vec<EventParam>,
}

impl EventRecord {
    pub fn new(event_date: NaiveDate, device_id: impl Into<String>) -> Self {
        Self {
            event_date,
            device_id: device_id.into(),
            parameters: Vec::new(),
        }
    }

    /// Add a string-valued parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(EventParam::string(key, value));
        self
    }

    /// Add an alternate identifier parameter
    pub fn with_alternate_id(self, id_type: AlternateIdType, value: impl Into<String>) -> Self {
        self.with_param(id_type.as_str(), value)
    }

    /// Convert to the storage-level form
    pub fn to_raw(&self) -> Result<RawEvent, serde_json::Error> {
        Ok(RawEvent {
            event_date: format_partition_date(self.event_date),
            device_id: Some(self.device_id.clone()),
            event_params: serde_json::to_string(&self.parameters)?,
        })
    }
}

/// An event as read from storage, before any parsing
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct RawEvent {
    /// Partition suffix (`YYYYMMDD`)
    pub event_date: String,
    #[sqlx(rename = "user_pseudo_id")]
    pub device_id: Option<String>,
    /// Parameter bag as JSON text
    pub event_params: String,
}

/// Identity signal extracted from one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySignal {
    #[serde(with = "partition_date")]
    pub event_date: NaiveDate,
    pub device_id: String,
    pub hashed_email: Option<String>,
    /// Values per type, first-seen order, no duplicates
    pub alternate_ids: BTreeMap<AlternateIdType, Vec<String>>,
}

impl IdentitySignal {
    pub fn new(event_date: NaiveDate, device_id: impl Into<String>) -> Self {
        Self {
            event_date,
            device_id: device_id.into(),
            hashed_email: None,
            alternate_ids: BTreeMap::new(),
        }
    }

    pub fn with_email(mut self, hashed_email: impl Into<String>) -> Self {
        self.hashed_email = Some(hashed_email.into());
        self
    }

    pub fn with_alternate_id(mut self, id_type: AlternateIdType, value: impl Into<String>) -> Self {
        self.push_alternate_id(id_type, value.into());
        self
    }

    /// Record an alternate identifier, ignoring repeats
    pub fn push_alternate_id(&mut self, id_type: AlternateIdType, value: String) {
        let values = self.alternate_ids.entry(id_type).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    /// Total number of alternate identifier values carried
    pub fn alternate_id_count(&self) -> usize {
        self.alternate_ids.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_param_value_identifier() {
        assert_eq!(ParamValue::string(" abc ").as_identifier().as_deref(), Some("abc"));
        assert_eq!(ParamValue::string("   ").as_identifier(), None);
        assert_eq!(ParamValue::int(42).as_identifier().as_deref(), Some("42"));
        assert_eq!(ParamValue::default().as_identifier(), None);
    }

    #[test]
    fn test_event_record_export_shape() {
        let record: EventRecord = serde_json::from_value(json!({
            "event_date": "20250606",
            "user_pseudo_id": "123.456",
            "event_params": [
                {"key": "guid_email", "value": {"string_value": "abc"}},
                {"key": "ga_session_id", "value": {"int_value": 99}}
            ]
        }))
        .unwrap();

        assert_eq!(record.event_date, NaiveDate::from_ymd_opt(2025, 6, 6).unwrap());
        assert_eq!(record.device_id, "123.456");
        assert_eq!(record.parameters.len(), 2);
        assert_eq!(record.parameters[1].value.int_value, Some(99));

        let raw = record.to_raw().unwrap();
        assert_eq!(raw.event_date, "20250606");
        assert_eq!(raw.device_id.as_deref(), Some("123.456"));
        assert!(raw.event_params.contains("guid_email"));
    }

    #[test]
    fn test_signal_dedups_alternate_ids() {
        let signal = IdentitySignal::new(NaiveDate::from_ymd_opt(2025, 6, 6).unwrap(), "d1")
            .with_alternate_id(AlternateIdType::Facebook, "F1")
            .with_alternate_id(AlternateIdType::Facebook, "F2")
            .with_alternate_id(AlternateIdType::Facebook, "F1");

        assert_eq!(
            signal.alternate_ids[&AlternateIdType::Facebook],
            vec!["F1".to_string(), "F2".to_string()]
        );
        assert_eq!(signal.alternate_id_count(), 2);
    }
}
