//! Merge pass summary returned to the trigger and operators

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{format_partition_date, option_partition_date, Watermark};

/// Outcome of one merge pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub run_id: Uuid,
    pub watermark: Watermark,

    /// Events read from partitions after the watermark
    pub events_scanned: usize,
    /// Events dropped because extraction failed
    pub events_skipped: usize,

    pub identities_inserted: usize,
    pub identities_updated: usize,
    /// Pairs already merged from the same or newer partitions
    pub replayed_identities: usize,

    pub alternates_inserted: usize,
    pub alternates_updated: usize,
    /// New identifier values appended across all alternate rows
    pub alternate_ids_added: usize,
    /// Alternate identifiers dropped because the event carried no hashed email
    pub orphaned_alternate_ids: usize,

    #[serde(default, with = "option_partition_date")]
    pub latest_event_date: Option<NaiveDate>,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl MergeReport {
    pub fn new(run_id: Uuid, watermark: Watermark, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            watermark,
            events_scanned: 0,
            events_skipped: 0,
            identities_inserted: 0,
            identities_updated: 0,
            replayed_identities: 0,
            alternates_inserted: 0,
            alternates_updated: 0,
            alternate_ids_added: 0,
            orphaned_alternate_ids: 0,
            latest_event_date: None,
            started_at,
            completed_at: started_at,
        }
    }

    pub fn rows_inserted(&self) -> usize {
        self.identities_inserted + self.alternates_inserted
    }

    pub fn rows_updated(&self) -> usize {
        self.identities_updated + self.alternates_updated
    }

    /// True when the pass wrote nothing
    pub fn is_noop(&self) -> bool {
        self.rows_inserted() == 0 && self.rows_updated() == 0
    }

    /// One-line status for the trigger's result surface
    pub fn status(&self) -> String {
        let latest = self
            .latest_event_date
            .map(format_partition_date)
            .unwrap_or_else(|| "none".to_string());
        format!(
            "Processing completed: watermark {} ({:?}), {} events scanned, {} skipped, \
             identities {} inserted / {} updated, alternate ids {} inserted / {} updated \
             ({} values added, {} orphaned), latest partition {}",
            self.watermark,
            self.watermark.source,
            self.events_scanned,
            self.events_skipped,
            self.identities_inserted,
            self.identities_updated,
            self.alternates_inserted,
            self.alternates_updated,
            self.alternate_ids_added,
            self.orphaned_alternate_ids,
            latest,
        )
    }
}
