//! Domain models for identity resolution
//!
//! Analytics events, extracted identity signals, identity records and
//! merge reports.

mod event;
mod identity;
mod report;
mod types;

pub use event::*;
pub use identity::*;
pub use report::*;
pub use types::*;
