//! Merge planning
//!
//! Computes the rows a merge pass must write from the window's signals and
//! the current snapshot of the touched identities. No I/O.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};

use super::reconcile;
use crate::domain::{AlternateIdType, AlternateIdentityRecord, IdentityRecord, IdentitySignal};

/// Counters gathered while planning
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanStats {
    pub signals: usize,
    pub replayed_identities: usize,
    pub alternate_ids_added: usize,
    pub orphaned_alternate_ids: usize,
    pub latest_event_date: Option<NaiveDate>,
}

/// Rows a merge pass writes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    pub identity_inserts: Vec<IdentityRecord>,
    pub identity_updates: Vec<IdentityRecord>,
    pub alternate_inserts: Vec<AlternateIdentityRecord>,
    pub alternate_updates: Vec<AlternateIdentityRecord>,
    pub stats: PlanStats,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.identity_inserts.is_empty()
            && self.identity_updates.is_empty()
            && self.alternate_inserts.is_empty()
            && self.alternate_updates.is_empty()
    }

    /// Identity rows to upsert, inserts first
    pub fn identities(&self) -> Vec<IdentityRecord> {
        self.identity_inserts
            .iter()
            .chain(&self.identity_updates)
            .cloned()
            .collect()
    }

    /// Alternate rows to upsert, inserts first
    pub fn alternates(&self) -> Vec<AlternateIdentityRecord> {
        self.alternate_inserts
            .iter()
            .chain(&self.alternate_updates)
            .cloned()
            .collect()
    }
}

/// (email, device) pair observed in the window
struct PairObservation<'a> {
    hashed_email: &'a str,
    device_id: &'a str,
    latest_event_date: NaiveDate,
    /// Alternate ids carried by this pair's events
    alternate_ids: Vec<(AlternateIdType, &'a str)>,
}

/// Values observed for one (email, type) pair, first-seen order
struct AlternateObservation<'a> {
    hashed_email: &'a str,
    id_type: AlternateIdType,
    values: Vec<String>,
}

/// Pass timestamp at storage precision
pub fn pass_timestamp(now: DateTime<Utc>) -> DateTime<Utc> {
    now.trunc_subsecs(6)
}

/// Plan one merge pass.
///
/// `identities` and `alternates` must hold every stored record for the
/// emails present in `signals`; records for other emails are ignored.
pub fn plan_merge(
    signals: &[IdentitySignal],
    identities: &[IdentityRecord],
    alternates: &[AlternateIdentityRecord],
    now: DateTime<Utc>,
) -> MergePlan {
    let now = pass_timestamp(now);
    let mut plan = MergePlan::default();
    plan.stats.signals = signals.len();

    let mut ordered: Vec<&IdentitySignal> = signals.iter().collect();
    ordered.sort_by_key(|s| s.event_date);

    let mut pairs: Vec<PairObservation<'_>> = Vec::new();
    let mut pair_index: HashMap<(&str, &str), usize> = HashMap::new();
    let mut observed: Vec<AlternateObservation<'_>> = Vec::new();
    let mut observed_index: HashMap<(&str, AlternateIdType), usize> = HashMap::new();

    for signal in ordered {
        plan.stats.latest_event_date = plan.stats.latest_event_date.max(Some(signal.event_date));

        let Some(email) = signal.hashed_email.as_deref() else {
            plan.stats.orphaned_alternate_ids += signal.alternate_id_count();
            continue;
        };

        let key = (email, signal.device_id.as_str());
        let i = match pair_index.get(&key).copied() {
            Some(i) => i,
            None => {
                pair_index.insert(key, pairs.len());
                pairs.push(PairObservation {
                    hashed_email: email,
                    device_id: &signal.device_id,
                    latest_event_date: signal.event_date,
                    alternate_ids: Vec::new(),
                });
                pairs.len() - 1
            }
        };
        let pair = &mut pairs[i];
        pair.latest_event_date = pair.latest_event_date.max(signal.event_date);
        for (&id_type, values) in &signal.alternate_ids {
            for value in values {
                if !pair.alternate_ids.contains(&(id_type, value.as_str())) {
                    pair.alternate_ids.push((id_type, value.as_str()));
                }
            }
        }

        for (&id_type, values) in &signal.alternate_ids {
            let i = *observed_index.entry((email, id_type)).or_insert_with(|| {
                observed.push(AlternateObservation {
                    hashed_email: email,
                    id_type,
                    values: Vec::new(),
                });
                observed.len() - 1
            });
            let entry = &mut observed[i];
            for value in values {
                if !entry.values.contains(value) {
                    entry.values.push(value.clone());
                }
            }
        }
    }

    let stored: HashMap<(&str, &str), &IdentityRecord> =
        identities.iter().map(|r| (r.key(), r)).collect();
    let stored_alternates: HashMap<(&str, AlternateIdType), &AlternateIdentityRecord> =
        alternates.iter().map(|r| (r.key(), r)).collect();

    for pair in pairs {
        match stored.get(&(pair.hashed_email, pair.device_id)) {
            Some(record) => {
                // A late event in an already merged partition still counts
                // when it brings an alternate id the email has not stored.
                let brings_new_id = pair.alternate_ids.iter().any(|(id_type, value)| {
                    stored_alternates
                        .get(&(pair.hashed_email, *id_type))
                        .map_or(true, |r| !r.contains(value))
                });
                let replay = !brings_new_id
                    && record
                        .last_event_date
                        .is_some_and(|last| pair.latest_event_date <= last);
                if replay {
                    plan.stats.replayed_identities += 1;
                    continue;
                }

                let mut updated = (*record).clone();
                let stamp = updated.last_updated().map_or(now, |last| last.max(now));
                updated.updated_date.push(stamp);
                updated.last_event_date =
                    updated.last_event_date.max(Some(pair.latest_event_date));
                plan.identity_updates.push(updated);
            }
            None => plan.identity_inserts.push(IdentityRecord::new(
                pair.hashed_email,
                pair.device_id,
                now,
                pair.latest_event_date,
            )),
        }
    }

    for obs in observed {
        let existing = stored_alternates.get(&(obs.hashed_email, obs.id_type)).copied();
        let reconciled = reconcile(existing, obs.hashed_email, obs.id_type, &obs.values, now);

        match existing {
            None if !reconciled.alternate_id.is_empty() => {
                plan.stats.alternate_ids_added += reconciled.alternate_id.len();
                plan.alternate_inserts.push(reconciled);
            }
            Some(prior) if reconciled != *prior => {
                plan.stats.alternate_ids_added +=
                    reconciled.updated_date.len() - prior.updated_date.len();
                plan.alternate_updates.push(reconciled);
            }
            _ => {}
        }
    }

    plan
}

/// In-memory identity tables with the gateway's upsert semantics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentitySnapshot {
    pub identities: Vec<IdentityRecord>,
    pub alternates: Vec<AlternateIdentityRecord>,
}

impl IdentitySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan a pass against this snapshot and apply it
    pub fn merge(&mut self, signals: &[IdentitySignal], now: DateTime<Utc>) -> MergePlan {
        let plan = plan_merge(signals, &self.identities, &self.alternates, now);
        self.apply(&plan);
        plan
    }

    /// Upsert a plan's rows, keeping stored ids and creation dates
    pub fn apply(&mut self, plan: &MergePlan) {
        for row in plan.identities() {
            match self.identities.iter().position(|r| r.key() == row.key()) {
                Some(i) => {
                    let stored = &mut self.identities[i];
                    stored.updated_date = row.updated_date;
                    stored.last_event_date = row.last_event_date;
                }
                None => self.identities.push(row),
            }
        }

        for row in plan.alternates() {
            match self.alternates.iter().position(|r| r.key() == row.key()) {
                Some(i) => self.alternates[i] = row,
                None => self.alternates.push(row),
            }
        }
    }

    pub fn identities_for_email<'a>(
        &'a self,
        hashed_email: &'a str,
    ) -> impl Iterator<Item = &'a IdentityRecord> + 'a {
        self.identities
            .iter()
            .filter(move |r| r.hashed_email == hashed_email)
    }

    pub fn alternate(
        &self,
        hashed_email: &str,
        id_type: AlternateIdType,
    ) -> Option<&AlternateIdentityRecord> {
        self.alternates
            .iter()
            .find(|r| r.key() == (hashed_email, id_type))
    }
}
