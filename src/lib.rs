//! Identity Resolution Library
//!
//! Incremental identity merge for web analytics exports: folds daily event
//! partitions into a canonical identity table keyed by hashed email, plus
//! deduplicated alternate identifier mappings.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (events, signals, identity records, reports)
//! - [`merge`] - Extraction, planning, alternate-ID reconciliation and the merge engine
//! - [`infra`] - Infrastructure implementations (PostgreSQL, SQLite, retry)
//! - [`config`] - Environment configuration
//! - [`job`] - Trigger entry point
//! - [`crypto`] - Email hashing
//! - [`telemetry`] - Structured logging setup

pub mod config;
pub mod crypto;
pub mod domain;
pub mod infra;
pub mod job;
pub mod merge;
pub mod migrations;
pub mod telemetry;

// Re-export commonly used types
pub use config::{BackendKind, ResolverConfig};
pub use domain::{
    AlternateIdType, AlternateIdentityRecord, CrossDeviceSummary, EventRecord, IdentityId,
    IdentityRecord, IdentitySignal, MergeReport, RawEvent, Watermark, WatermarkSource,
};
pub use infra::{
    EventSource, ExtractionError, IdentityError, IdentityStore, PersistenceGateway, Result,
};
pub use job::{parse_trigger_watermark, run_merge_job, JobOutcome};
pub use merge::IdentityMergeEngine;
