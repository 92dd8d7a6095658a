//! Release lock manager: per-release mutual exclusion plus a global limiter.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use metrics::histogram;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("release lock manager closed")]
pub struct LocksClosed;

/// Proof of exclusive access to one release. Dropping it releases the lock.
#[derive(Debug)]
pub struct ReleaseGuard {
    key: String,
    _release: OwnedMutexGuard<()>,
    _permit: OwnedSemaphorePermit,
}

impl ReleaseGuard {
    pub fn key(&self) -> &str { &self.key }
}

/// Lock entries are created on first use and never removed: cardinality is the
/// number of distinct releases seen by this process.
pub struct ReleaseLocks {
    locks: Mutex<FxHashMap<String, Arc<AsyncMutex<()>>>>,
    limiter: Arc<Semaphore>,
}

impl ReleaseLocks {
    /// `max_concurrent` bounds how many releases may be operated on at once.
    pub fn new(max_concurrent: usize) -> Self {
        Self { locks: Mutex::new(FxHashMap::default()), limiter: Arc::new(Semaphore::new(max_concurrent.max(1))) }
    }

    /// Wait for exclusive access to `key`.
    ///
    /// The release lock is taken before the global permit so a task queued
    /// behind a busy release never occupies a global slot.
    pub async fn acquire(&self, key: &str) -> Result<ReleaseGuard, LocksClosed> {
        let t0 = Instant::now();
        let entry = {
            let mut map = lock(&self.locks);
            Arc::clone(map.entry(key.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
        };
        let release = entry.lock_owned().await;
        let permit = Arc::clone(&self.limiter).acquire_owned().await.map_err(|_| LocksClosed)?;
        histogram!("release_lock_wait_ms", t0.elapsed().as_secs_f64() * 1000.0);
        trace!(release = %key, "release lock acquired");
        Ok(ReleaseGuard { key: key.to_string(), _release: release, _permit: permit })
    }

    pub fn release(&self, guard: ReleaseGuard) {
        trace!(release = %guard.key, "release lock released");
        drop(guard);
    }

    /// Fail all pending and future acquisitions. Held guards stay valid.
    pub fn close(&self) { self.limiter.close(); }

    /// Number of distinct release keys ever locked.
    pub fn len(&self) -> usize { lock(&self.locks).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn available_permits(&self) -> usize { self.limiter.available_permits() }
}
