//! Watchers: the primary kind feeding the controller, and dependent kinds
//! mapped back to their owners.

use std::sync::Arc;

use anyhow::Result;
use futures::TryStreamExt;
use keel_controller::Trigger;
use keel_core::{Gvk, ObjectKey};
use keel_metrics::Predicate;
use keel_store::WatchRegistrar;
use kube::core::DynamicObject;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::convert::{object_key, owners_of};
use crate::discovery::ApiResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Create,
    Update,
    Delete,
}

/// Turns watch events into lifecycle events per object key.
///
/// A relist reports objects that vanished while the watch was down as deletions.
#[derive(Default)]
pub struct PrimaryTracker {
    seen: FxHashSet<ObjectKey>,
}

impl PrimaryTracker {
    pub fn observe(&mut self, gvk: &Gvk, ev: Event<DynamicObject>) -> Vec<(Lifecycle, ObjectKey)> {
        match ev {
            Event::Applied(o) => object_key(gvk, &o).map(|k| vec![self.applied(k)]).unwrap_or_default(),
            Event::Deleted(o) => object_key(gvk, &o)
                .map(|k| {
                    self.seen.remove(&k);
                    vec![(Lifecycle::Delete, k)]
                })
                .unwrap_or_default(),
            Event::Restarted(list) => {
                let fresh: FxHashSet<ObjectKey> = list.iter().filter_map(|o| object_key(gvk, o)).collect();
                let mut gone: Vec<ObjectKey> = self.seen.difference(&fresh).cloned().collect();
                gone.sort();
                let mut out: Vec<(Lifecycle, ObjectKey)> = gone.into_iter().map(|k| (Lifecycle::Delete, k)).collect();
                self.seen.retain(|k| fresh.contains(k));
                let mut keys: Vec<ObjectKey> = fresh.into_iter().collect();
                keys.sort();
                for k in keys { out.push(self.applied(k)); }
                out
            }
        }
    }

    fn applied(&mut self, k: ObjectKey) -> (Lifecycle, ObjectKey) {
        if self.seen.insert(k.clone()) { (Lifecycle::Create, k) } else { (Lifecycle::Update, k) }
    }

    pub fn len(&self) -> usize { self.seen.len() }

    pub fn is_empty(&self) -> bool { self.seen.is_empty() }
}

/// List+watch the primary kind until cancelled, feeding every key into `trigger`.
pub async fn watch_primary(
    resolver: Arc<ApiResolver>,
    gvk: Gvk,
    namespace: Option<String>,
    trigger: Trigger,
    predicate: Predicate,
    cancel: CancellationToken,
) -> Result<()> {
    let api = resolver.api(&gvk, namespace.as_deref()).await?;
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    let mut tracker = PrimaryTracker::default();
    info!(gvk = %gvk, ns = ?namespace, "primary watcher started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.try_next() => next,
        };
        let ev = match next {
            Ok(Some(ev)) => ev,
            Ok(None) => {
                warn!(gvk = %gvk, "primary watch stream ended");
                break;
            }
            Err(e) => {
                counter!("watch_errors_total", 1u64, "role" => "primary");
                warn!(gvk = %gvk, error = %e, "primary watch error");
                continue;
            }
        };
        for (lc, key) in tracker.observe(&gvk, ev) {
            match lc {
                Lifecycle::Create => predicate.create(&key),
                Lifecycle::Update => predicate.update(&key, &key),
                Lifecycle::Delete => predicate.delete(&key),
            };
            if !trigger.send(key).await {
                debug!(gvk = %gvk, "controller gone, primary watcher exiting");
                return Ok(());
            }
        }
    }
    info!(gvk = %gvk, "primary watcher stopped");
    Ok(())
}

/// Drops child updates that did not change the child's spec generation.
///
/// Kinds without a generation (ConfigMaps, Secrets) always pass.
#[derive(Default)]
pub struct ChildFilter {
    generations: FxHashMap<String, i64>,
}

impl ChildFilter {
    pub fn admit(&mut self, obj: &DynamicObject, deleted: bool) -> bool {
        let Some(uid) = obj.metadata.uid.clone() else { return true };
        if deleted {
            self.generations.remove(&uid);
            return true;
        }
        match obj.metadata.generation {
            Some(g) => self.generations.insert(uid, g) != Some(g),
            None => true,
        }
    }
}

/// Starts one watcher per dependent kind; events re-trigger the owning object.
pub struct KubeWatchRegistrar {
    resolver: Arc<ApiResolver>,
    namespace: Option<String>,
    trigger: Trigger,
    cancel: CancellationToken,
}

impl KubeWatchRegistrar {
    pub fn new(resolver: Arc<ApiResolver>, namespace: Option<String>, trigger: Trigger, cancel: CancellationToken) -> Self {
        Self { resolver, namespace, trigger, cancel }
    }
}

#[async_trait::async_trait]
impl WatchRegistrar for KubeWatchRegistrar {
    async fn register(&self, kind: &Gvk, owner: &Gvk) -> Result<()> {
        // Resolve up front so an unknown kind fails the registration instead of the task.
        let api = self.resolver.api(kind, self.namespace.as_deref()).await?;
        let (_, owner_namespaced) = self.resolver.resolve(owner).await?;
        let (kind, owner) = (kind.clone(), owner.clone());
        let (trigger, cancel) = (self.trigger.clone(), self.cancel.clone());
        tokio::spawn(async move {
            watch_dependents(api, kind, owner, owner_namespaced, trigger, cancel).await;
        });
        Ok(())
    }
}

async fn watch_dependents(
    api: kube::Api<DynamicObject>,
    kind: Gvk,
    owner: Gvk,
    owner_namespaced: bool,
    trigger: Trigger,
    cancel: CancellationToken,
) {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    let mut filter = ChildFilter::default();
    let label = kind.key();
    info!(kind = %kind, owner = %owner, "dependent watcher started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.try_next() => next,
        };
        let children: Vec<(DynamicObject, bool)> = match next {
            Ok(Some(Event::Applied(o))) => vec![(o, false)],
            Ok(Some(Event::Deleted(o))) => vec![(o, true)],
            Ok(Some(Event::Restarted(list))) => list.into_iter().map(|o| (o, false)).collect(),
            Ok(None) => break,
            Err(e) => {
                counter!("watch_errors_total", 1u64, "role" => "dependent");
                warn!(kind = %kind, error = %e, "dependent watch error");
                continue;
            }
        };
        for (child, deleted) in children {
            if !filter.admit(&child, deleted) { continue; }
            for key in owners_of(&child, &owner, owner_namespaced) {
                counter!("dependent_events_total", 1u64, "kind" => label.clone());
                if !trigger.send(key).await { return; }
            }
        }
    }
    info!(kind = %kind, "dependent watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gvk() -> Gvk { Gvk::new("apps.example.com", "v1", "Nginx") }

    fn obj(name: &str) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "apps.example.com/v1",
            "kind": "Nginx",
            "metadata": {"name": name, "namespace": "prod"}
        }))
        .unwrap()
    }

    fn key(name: &str) -> ObjectKey { ObjectKey::new(gvk(), Some("prod"), name) }

    #[test]
    fn tracker_reports_lifecycle() {
        let mut t = PrimaryTracker::default();
        assert_eq!(t.observe(&gvk(), Event::Applied(obj("a"))), vec![(Lifecycle::Create, key("a"))]);
        assert_eq!(t.observe(&gvk(), Event::Applied(obj("a"))), vec![(Lifecycle::Update, key("a"))]);
        assert_eq!(t.observe(&gvk(), Event::Applied(obj("b"))), vec![(Lifecycle::Create, key("b"))]);
        assert_eq!(t.observe(&gvk(), Event::Deleted(obj("b"))), vec![(Lifecycle::Delete, key("b"))]);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn relist_reports_vanished_objects() {
        let mut t = PrimaryTracker::default();
        t.observe(&gvk(), Event::Applied(obj("a")));
        t.observe(&gvk(), Event::Applied(obj("b")));
        let out = t.observe(&gvk(), Event::Restarted(vec![obj("b"), obj("c")]));
        assert_eq!(
            out,
            vec![(Lifecycle::Delete, key("a")), (Lifecycle::Update, key("b")), (Lifecycle::Create, key("c"))]
        );
        assert_eq!(t.len(), 2);
    }

    fn child(uid: &str, generation: Option<i64>) -> DynamicObject {
        let mut meta = serde_json::json!({"name": "web", "namespace": "prod", "uid": uid});
        if let Some(g) = generation { meta["generation"] = serde_json::json!(g); }
        serde_json::from_value(serde_json::json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": meta})).unwrap()
    }

    #[test]
    fn child_filter_skips_status_only_updates() {
        let mut f = ChildFilter::default();
        assert!(f.admit(&child("u1", Some(1)), false));
        assert!(!f.admit(&child("u1", Some(1)), false));
        assert!(f.admit(&child("u1", Some(2)), false));
        assert!(f.admit(&child("u2", None), false));
        assert!(f.admit(&child("u2", None), false));
        assert!(f.admit(&child("u1", Some(2)), true));
        assert!(f.admit(&child("u1", Some(2)), false));
    }
}
