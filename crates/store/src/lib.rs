//! Classy store: process-local state shared by reconciler workers.
//!
//! Nothing here is a source of truth. Both structures can be rebuilt from the
//! persisted classifier status after a restart.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

pub mod index;
pub mod keys;

pub use index::ConsistencyIndex;
pub use keys::{KeyError, KeyManager, LabelArbiter};

/// Lock a mutex, recovering the data if a previous holder panicked. Every critical
/// section in this crate leaves the maps consistent before it can panic.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
