//! Alternate-ID reconciliation
//!
//! Folds newly observed identifiers into the stored list for one
//! (hashed email, type) pair without ever repeating a value.

use chrono::{DateTime, Utc};

use crate::domain::{AlternateIdType, AlternateIdentityRecord};

/// Merge `new_values` into `existing`.
///
/// Genuinely new values are appended in the given order, each with one
/// `updated_date` entry. With nothing new the existing record comes back
/// unchanged (an empty record when there was none).
pub fn reconcile(
    existing: Option<&AlternateIdentityRecord>,
    hashed_email: &str,
    id_type: AlternateIdType,
    new_values: &[String],
    now: DateTime<Utc>,
) -> AlternateIdentityRecord {
    let mut record = existing
        .cloned()
        .unwrap_or_else(|| AlternateIdentityRecord::empty(hashed_email, id_type));

    let mut fresh: Vec<&String> = Vec::new();
    for value in new_values {
        if !record.contains(value) && !fresh.contains(&value) {
            fresh.push(value);
        }
    }

    if fresh.is_empty() {
        return record;
    }

    // Legacy rows may hold repeats; the rewritten row must not.
    let mut seen = std::collections::HashSet::with_capacity(record.alternate_id.len());
    record.alternate_id.retain(|v| seen.insert(v.clone()));

    let stamp = record.last_updated().map_or(now, |last| last.max(now));
    for value in fresh {
        record.alternate_id.push(value.clone());
        record.updated_date.push(stamp);
    }

    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 7, hour, 0, 0).unwrap()
    }

    fn values(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_observation() {
        let record = reconcile(
            None,
            "h1",
            AlternateIdType::Facebook,
            &values(&["F1", "F1", "F2"]),
            ts(1),
        );
        assert_eq!(record.hashed_email, "h1");
        assert_eq!(record.alternate_id, values(&["F1", "F2"]));
        assert_eq!(record.updated_date, vec![ts(1), ts(1)]);
    }

    #[test]
    fn test_appends_only_new_values() {
        let existing = reconcile(None, "h1", AlternateIdType::TikTok, &values(&["T1"]), ts(1));
        let record = reconcile(
            Some(&existing),
            "h1",
            AlternateIdType::TikTok,
            &values(&["T1", "T2"]),
            ts(2),
        );
        assert_eq!(record.alternate_id, values(&["T1", "T2"]));
        assert_eq!(record.updated_date, vec![ts(1), ts(2)]);
    }

    #[test]
    fn test_nothing_new_returns_existing_unchanged() {
        let existing = reconcile(None, "h1", AlternateIdType::Reddit, &values(&["R1"]), ts(1));
        let record = reconcile(
            Some(&existing),
            "h1",
            AlternateIdType::Reddit,
            &values(&["R1"]),
            ts(5),
        );
        assert_eq!(record, existing);

        let empty = reconcile(None, "h1", AlternateIdType::Reddit, &[], ts(1));
        assert!(empty.alternate_id.is_empty());
        assert!(empty.updated_date.is_empty());
    }

    #[test]
    fn test_legacy_duplicates_collapsed_on_write() {
        let legacy = AlternateIdentityRecord {
            hashed_email: "h1".into(),
            alternate_id_type: AlternateIdType::GoogleAds,
            alternate_id: values(&["G1", "G1", "G2"]),
            updated_date: vec![ts(1), ts(1), ts(2)],
        };

        let untouched = reconcile(
            Some(&legacy),
            "h1",
            AlternateIdType::GoogleAds,
            &values(&["G2"]),
            ts(3),
        );
        assert_eq!(untouched, legacy);

        let record = reconcile(
            Some(&legacy),
            "h1",
            AlternateIdType::GoogleAds,
            &values(&["G3"]),
            ts(3),
        );
        assert_eq!(record.alternate_id, values(&["G1", "G2", "G3"]));
        assert_eq!(record.updated_date.len(), legacy.updated_date.len() + 1);
    }

    #[test]
    fn test_stamp_never_goes_backwards() {
        let existing = reconcile(None, "h1", AlternateIdType::Floodlight, &values(&["X"]), ts(5));
        let record = reconcile(
            Some(&existing),
            "h1",
            AlternateIdType::Floodlight,
            &values(&["Y"]),
            ts(1),
        );
        assert_eq!(record.updated_date, vec![ts(5), ts(5)]);
    }
}
