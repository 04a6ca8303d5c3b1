//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use identity_resolution::domain::{AlternateIdType, EventRecord, IdentityRecord};
use identity_resolution::infra::{connect_sqlite, SqliteEventSource, SqliteIdentityStore};
use identity_resolution::{IdentityMergeEngine, IdentityStore};

/// Test hashed email used by most fixtures
pub const H1: &str = "H1";
pub const H2: &str = "H2";

/// Date in the June 2025 fixture window
pub fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
}

/// Pass timestamp on the given June 2025 day
pub fn ts(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, day, 6, 0, 0).unwrap()
}

/// In-memory database with event source and identity store sharing one pool
pub struct TestDb {
    pub events: SqliteEventSource,
    pub store: SqliteIdentityStore,
}

impl TestDb {
    pub fn engine(&self) -> IdentityMergeEngine {
        IdentityMergeEngine::new(
            Arc::new(self.events.clone()),
            Arc::new(self.store.clone()),
            Arc::new(self.store.clone()),
        )
    }

    pub async fn load(&self, events: &[EventRecord]) {
        self.events.append(events).await.unwrap();
    }

    pub async fn identities(&self, hashed_email: &str) -> Vec<IdentityRecord> {
        self.store.identities_for_email(hashed_email).await.unwrap()
    }

    pub async fn identity(&self, hashed_email: &str, ga_id: &str) -> IdentityRecord {
        self.identities(hashed_email)
            .await
            .into_iter()
            .find(|r| r.ga_id == ga_id)
            .unwrap_or_else(|| panic!("no identity for {hashed_email}/{ga_id}"))
    }
}

/// Create a migrated in-memory SQLite database
pub async fn create_test_db() -> TestDb {
    let pool = connect_sqlite("sqlite::memory:", 1).await.unwrap();
    identity_resolution::migrations::run_sqlite(&pool)
        .await
        .unwrap();

    TestDb {
        events: SqliteEventSource::new(pool.clone()),
        store: SqliteIdentityStore::new(pool),
    }
}

/// Event carrying a hashed email
pub fn email_event(day: u32, device_id: &str, hashed_email: &str) -> EventRecord {
    EventRecord::new(date(day), device_id).with_param("guid_email", hashed_email)
}

/// Event carrying a hashed email and one Facebook id
pub fn fb_event(day: u32, device_id: &str, hashed_email: &str, fb_id: &str) -> EventRecord {
    email_event(day, device_id, hashed_email).with_alternate_id(AlternateIdType::Facebook, fb_id)
}
