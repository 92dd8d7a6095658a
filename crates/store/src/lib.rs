//! Keel store: process-scoped shared state for reconcilers.
//!
//! Two structures are shared between reconcile workers: the release lock map
//! and the dependent watch sets. Both are constructed once per reconciler and
//! passed in by `Arc`; nothing here is a global.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod dependents;
pub mod locks;

pub use dependents::{DependentError, DependentWatches, RecordingRegistrar, WatchRegistrar, WatchSync};
pub use locks::{LocksClosed, ReleaseGuard, ReleaseLocks};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }
