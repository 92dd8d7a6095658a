//! Dependent watch manager: manifest-driven discovery of child kinds.
//!
//! Kind-level registrations are monotonic. Once a kind is watched on behalf of
//! an owner kind it stays watched for the life of the process, even when later
//! chart versions stop rendering it; only the per-object sets are pruned.
//! Registration of one kind is serialized: a concurrent sync waits for the
//! attempt in flight and retries it itself if that attempt failed.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use keel_core::manifest::{self, ManifestError};
use keel_core::{Gvk, ObjectKey};
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::lock;

/// Starts a watch on a child kind whose events re-trigger the owning object.
#[async_trait::async_trait]
pub trait WatchRegistrar: Send + Sync {
    async fn register(&self, kind: &Gvk, owner: &Gvk) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum DependentError {
    #[error("parsing release manifest: {0}")]
    Manifest(#[from] ManifestError),
    #[error("registering watch for {kind}: {source:#}")]
    Register { kind: Gvk, source: anyhow::Error },
}

/// Outcome of one sync: kinds newly registered and the object's full kind set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSync {
    pub registered: Vec<Gvk>,
    pub kinds: BTreeSet<Gvk>,
}

pub struct DependentWatches {
    owner: Gvk,
    registrar: Arc<dyn WatchRegistrar>,
    registered: Mutex<FxHashMap<Gvk, Arc<OnceCell<()>>>>,
    per_object: Mutex<FxHashMap<ObjectKey, BTreeSet<Gvk>>>,
}

impl DependentWatches {
    pub fn new(owner: Gvk, registrar: Arc<dyn WatchRegistrar>) -> Self {
        Self { owner, registrar, registered: Mutex::new(FxHashMap::default()), per_object: Mutex::new(FxHashMap::default()) }
    }

    pub fn owner(&self) -> &Gvk { &self.owner }

    /// Bring the watch set for `key` in line with `manifest`.
    ///
    /// A failed registration leaves the kind unregistered so the next sync
    /// retries it; the object's set is only replaced once every kind is
    /// registered.
    pub async fn sync(&self, key: &ObjectKey, manifest: &str) -> Result<WatchSync, DependentError> {
        let mut kinds = manifest::kinds(manifest)?;
        kinds.remove(&self.owner);

        let mut newly = Vec::new();
        for kind in kinds.iter() {
            let cell = Arc::clone(lock(&self.registered).entry(kind.clone()).or_default());
            let mut ran = false;
            let res = cell
                .get_or_try_init(|| {
                    ran = true;
                    self.registrar.register(kind, &self.owner)
                })
                .await;
            if let Err(source) = res {
                counter!("dependent_watch_errors_total", 1u64);
                return Err(DependentError::Register { kind: kind.clone(), source });
            }
            if ran {
                info!(owner = %self.owner, kind = %kind, "dependent watch registered");
                counter!("dependent_watches_registered_total", 1u64);
                newly.push(kind.clone());
            }
        }

        let tracked = {
            let mut per = lock(&self.per_object);
            per.insert(key.clone(), kinds.clone());
            per.len()
        };
        gauge!("dependent_watch_objects", tracked as f64);
        debug!(object = %key, kinds = kinds.len(), new = newly.len(), "dependent watch set synced");
        Ok(WatchSync { registered: newly, kinds })
    }

    /// Drop the per-object mapping. Kind registrations are left in place.
    pub fn forget(&self, key: &ObjectKey) -> Option<BTreeSet<Gvk>> {
        let mut per = lock(&self.per_object);
        let prev = per.remove(key);
        gauge!("dependent_watch_objects", per.len() as f64);
        prev
    }

    pub fn watched(&self, key: &ObjectKey) -> Option<BTreeSet<Gvk>> { lock(&self.per_object).get(key).cloned() }

    pub fn registered_kinds(&self) -> BTreeSet<Gvk> {
        lock(&self.registered).iter().filter(|(_, c)| c.initialized()).map(|(k, _)| k.clone()).collect()
    }
}

/// Registrar that records registrations instead of talking to a cluster.
#[derive(Debug, Default)]
pub struct RecordingRegistrar {
    calls: Mutex<Vec<(Gvk, Gvk)>>,
    fail: Mutex<FxHashSet<Gvk>>,
}

impl RecordingRegistrar {
    pub fn new() -> Self { Self::default() }

    /// `(kind, owner)` pairs in registration order.
    pub fn registrations(&self) -> Vec<(Gvk, Gvk)> { lock(&self.calls).clone() }

    /// Make registrations of `kind` fail until [`RecordingRegistrar::heal`] is called.
    pub fn fail_on(&self, kind: Gvk) { lock(&self.fail).insert(kind); }

    pub fn heal(&self) { lock(&self.fail).clear(); }
}

#[async_trait::async_trait]
impl WatchRegistrar for RecordingRegistrar {
    async fn register(&self, kind: &Gvk, owner: &Gvk) -> anyhow::Result<()> {
        if lock(&self.fail).contains(kind) {
            anyhow::bail!("injected failure for {}", kind);
        }
        lock(&self.calls).push((kind.clone(), owner.clone()));
        Ok(())
    }
}
