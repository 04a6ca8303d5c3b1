//! Event extractor
//!
//! Turns raw analytics events into identity signals. Pure: no storage access,
//! and a malformed event only fails its own extraction.

use chrono::NaiveDate;
use serde::Deserialize;

use crate::domain::{
    parse_partition_date, AlternateIdType, IdentitySignal, ParamValue, RawEvent,
    DEFAULT_HASHED_EMAIL_KEY,
};
use crate::infra::ExtractionError;

/// Parameter bag entry as exported; both fields may be null
#[derive(Debug, Deserialize)]
struct BagEntry {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<ParamValue>,
}

/// Extracts hashed email, device and alternate identifiers from events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventExtractor {
    hashed_email_key: String,
}

impl Default for EventExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_HASHED_EMAIL_KEY)
    }
}

impl EventExtractor {
    pub fn new(hashed_email_key: impl Into<String>) -> Self {
        Self {
            hashed_email_key: hashed_email_key.into(),
        }
    }

    pub fn hashed_email_key(&self) -> &str {
        &self.hashed_email_key
    }

    /// Extract the identity signal carried by one event
    pub fn extract(&self, raw: &RawEvent) -> Result<IdentitySignal, ExtractionError> {
        let event_date = parse_partition_date(&raw.event_date)
            .ok_or_else(|| ExtractionError::InvalidEventDate(raw.event_date.clone()))?;

        let device_id = raw
            .device_id
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .ok_or(ExtractionError::MissingDeviceId)?;

        let bag: Vec<BagEntry> = serde_json::from_str(&raw.event_params)
            .map_err(|e| ExtractionError::MalformedParameters(e.to_string()))?;

        let mut signal = IdentitySignal::new(event_date, device_id);

        for entry in bag {
            let key = entry.key.unwrap_or_default();
            if key.trim().is_empty() {
                return Err(ExtractionError::EmptyParameterKey);
            }

            let Some(value) = entry.value.as_ref().and_then(ParamValue::as_identifier) else {
                continue;
            };

            if key == self.hashed_email_key {
                match &signal.hashed_email {
                    Some(first) if *first != value => {
                        return Err(ExtractionError::ConflictingHashedEmail {
                            first: first.clone(),
                            second: value,
                        });
                    }
                    Some(_) => {}
                    None => signal.hashed_email = Some(value),
                }
            } else if let Some(id_type) = AlternateIdType::from_param_key(&key) {
                signal.push_alternate_id(id_type, value);
            }
        }

        Ok(signal)
    }

    /// Lazily extract signals from events in partitions after `since`.
    ///
    /// Events at or before `since` are dropped without error. Events whose
    /// date cannot be parsed are kept so the failure is reported.
    pub fn signals<'a, I>(
        &'a self,
        raws: I,
        since: Option<NaiveDate>,
    ) -> impl Iterator<Item = Result<IdentitySignal, ExtractionError>> + 'a
    where
        I: IntoIterator<Item = &'a RawEvent>,
        I::IntoIter: 'a,
    {
        raws.into_iter()
            .filter(move |raw| match (since, parse_partition_date(&raw.event_date)) {
                (Some(since), Some(date)) => date > since,
                _ => true,
            })
            .map(move |raw| self.extract(raw))
    }
}
