//! Hashing utilities for identity resolution
//!
//! Produces the one-way email hashes used as the cross-device join key.

mod hash;

pub use hash::*;
