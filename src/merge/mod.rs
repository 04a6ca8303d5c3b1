//! Incremental identity merge
//!
//! - `extractor`: raw events to identity signals
//! - `reconciler`: duplicate-free alternate-ID lists
//! - `planner`: rows to write for one pass
//! - `engine`: watermark, scan, plan, apply

mod engine;
mod extractor;
mod planner;
mod reconciler;

pub use engine::{default_epoch_floor, IdentityMergeEngine};
pub use extractor::EventExtractor;
pub use planner::{pass_timestamp, plan_merge, IdentitySnapshot, MergePlan, PlanStats};
pub use reconciler::reconcile;
