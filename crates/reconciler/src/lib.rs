//! Keel reconciler: drives one managed object toward its desired release.
//!
//! Each invocation re-reads the object and the release, decides a single
//! action, performs it under the release lock, and reports an [`Outcome`] or a
//! classified [`ReconcileError`]. Retries are the caller's business.

#![forbid(unsafe_code)]

use std::time::Duration;

pub mod client;
pub mod error;
pub mod memory;
pub mod provenance;
mod reconciler;

pub use client::{ObjectClient, ObjectError};
pub use error::{ErrorClass, ReconcileError};
pub use memory::MemoryObjectClient;
pub use reconciler::{decide, Reconciler, State};

/// Successful reconcile result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Reconcile again after the given delay even if nothing changes.
    RequeueAfter(Duration),
}

impl Outcome {
    /// `RequeueAfter(period)`, or `Done` when the period is zero.
    pub fn after(period: Duration) -> Self {
        if period.is_zero() { Outcome::Done } else { Outcome::RequeueAfter(period) }
    }
}
