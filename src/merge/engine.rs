//! Identity merge engine
//!
//! Runs one incremental merge pass: resolve the watermark, scan the event
//! window, extract signals, plan against the stored snapshot and hand the
//! resulting rows to the persistence gateway in a single batch.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{pass_timestamp, plan_merge, EventExtractor};
use crate::domain::{IdentitySignal, MergeReport, Watermark};
use crate::infra::{EventSource, IdentityError, IdentityStore, PersistenceGateway, Result};

/// Date assumed merged when the identity table is still empty
pub fn default_epoch_floor() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 3).unwrap_or(NaiveDate::MIN)
}

/// Folds event partitions into the identity tables
pub struct IdentityMergeEngine {
    events: Arc<dyn EventSource>,
    store: Arc<dyn IdentityStore>,
    gateway: Arc<dyn PersistenceGateway>,
    extractor: EventExtractor,
    epoch_floor: NaiveDate,
}

impl IdentityMergeEngine {
    pub fn new(
        events: Arc<dyn EventSource>,
        store: Arc<dyn IdentityStore>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        Self {
            events,
            store,
            gateway,
            extractor: EventExtractor::default(),
            epoch_floor: default_epoch_floor(),
        }
    }

    pub fn with_extractor(mut self, extractor: EventExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_epoch_floor(mut self, epoch_floor: NaiveDate) -> Self {
        self.epoch_floor = epoch_floor;
        self
    }

    pub fn epoch_floor(&self) -> NaiveDate {
        self.epoch_floor
    }

    /// Pick the exclusive lower bound for the next pass.
    ///
    /// An explicit date wins; otherwise the date of the newest
    /// `updated_date` entry; otherwise the epoch floor.
    pub async fn resolve_watermark(&self, since: Option<NaiveDate>) -> Result<Watermark> {
        if let Some(date) = since {
            return Ok(Watermark::explicit(date));
        }

        let watermark = match self.store.latest_update().await? {
            Some(latest) => Watermark::derived(latest.date_naive()),
            None => Watermark::epoch_floor(self.epoch_floor),
        };
        Ok(watermark)
    }

    /// Run one merge pass with the wall clock
    pub async fn merge(&self, since: Option<NaiveDate>) -> Result<MergeReport> {
        self.merge_at(since, Utc::now()).await
    }

    /// Run one merge pass stamped with `now`
    #[instrument(skip(self, now), fields(run_id))]
    pub async fn merge_at(
        &self,
        since: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> Result<MergeReport> {
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let now = pass_timestamp(now);
        let watermark = self.resolve_watermark(since).await?;
        let mut report = MergeReport::new(run_id, watermark, now);

        info!(
            watermark = %watermark,
            source = ?watermark.source,
            "starting identity merge pass"
        );

        let raws = self
            .events
            .scan_after(Some(watermark.date))
            .await
            .map_err(|e| merge_failed(&watermark, 0, e))?;
        report.events_scanned = raws.len();

        let mut signals: Vec<IdentitySignal> = Vec::with_capacity(raws.len());
        for result in self.extractor.signals(&raws, Some(watermark.date)) {
            match result {
                Ok(signal) => signals.push(signal),
                Err(e) => {
                    warn!(error = %e, "skipping event that failed extraction");
                    report.events_skipped += 1;
                }
            }
        }

        if signals.is_empty() {
            report.completed_at = Utc::now().max(now);
            info!(
                events_scanned = report.events_scanned,
                events_skipped = report.events_skipped,
                "no identity signals in window; nothing to write"
            );
            return Ok(report);
        }

        let emails: Vec<String> = signals
            .iter()
            .filter_map(|s| s.hashed_email.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let scanned = report.events_scanned;
        let identities = self
            .store
            .identities_for_emails(&emails)
            .await
            .map_err(|e| merge_failed(&watermark, scanned, e))?;
        let alternates = self
            .store
            .alternates_for_emails(&emails)
            .await
            .map_err(|e| merge_failed(&watermark, scanned, e))?;

        debug!(
            signals = signals.len(),
            emails = emails.len(),
            stored_identities = identities.len(),
            stored_alternates = alternates.len(),
            "loaded identity snapshot"
        );

        let plan = plan_merge(&signals, &identities, &alternates, now);

        if plan.stats.orphaned_alternate_ids > 0 {
            warn!(
                orphaned = plan.stats.orphaned_alternate_ids,
                "discarding alternate ids from events without a hashed email"
            );
        }

        if !plan.is_empty() {
            self.gateway
                .apply(&plan.identities(), &plan.alternates())
                .await
                .map_err(|e| merge_failed(&watermark, scanned, e))?;
        }

        report.identities_inserted = plan.identity_inserts.len();
        report.identities_updated = plan.identity_updates.len();
        report.replayed_identities = plan.stats.replayed_identities;
        report.alternates_inserted = plan.alternate_inserts.len();
        report.alternates_updated = plan.alternate_updates.len();
        report.alternate_ids_added = plan.stats.alternate_ids_added;
        report.orphaned_alternate_ids = plan.stats.orphaned_alternate_ids;
        report.latest_event_date = plan.stats.latest_event_date;
        report.completed_at = Utc::now().max(now);

        info!(
            events_scanned = report.events_scanned,
            events_skipped = report.events_skipped,
            identities_inserted = report.identities_inserted,
            identities_updated = report.identities_updated,
            replayed = report.replayed_identities,
            alternates_inserted = report.alternates_inserted,
            alternates_updated = report.alternates_updated,
            "identity merge pass committed"
        );

        Ok(report)
    }
}

fn merge_failed(
    watermark: &Watermark,
    events_scanned: usize,
    source: IdentityError,
) -> IdentityError {
    IdentityError::MergeFailed {
        watermark: watermark.date,
        events_scanned,
        source: Box::new(source),
    }
}
