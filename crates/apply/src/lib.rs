//! Keel apply: server-side apply of rendered release manifests, used to put
//! drifted release resources back to their rendered state.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use keel_action::ManifestApplier;
use keel_core::manifest::{self, ManifestObject};
use keel_kubehub::ApiResolver;
use kube::api::{Patch, PatchParams};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

pub const FIELD_MANAGER: &str = "keel-operator";

fn max_manifest_bytes() -> usize {
    std::env::var("KEEL_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(8_000_000)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Applies every object of a manifest with a forced server-side apply.
pub struct KubeApplier {
    resolver: Arc<ApiResolver>,
    field_manager: String,
}

impl KubeApplier {
    pub fn new(resolver: Arc<ApiResolver>) -> Self { Self { resolver, field_manager: FIELD_MANAGER.to_string() } }

    async fn apply_one(&self, release_ns: &str, obj: &ManifestObject) -> Result<DiffSummary> {
        let (_, namespaced) = self.resolver.resolve(&obj.gvk).await?;
        let ns = target_namespace(obj, release_ns, namespaced);
        let api = self.resolver.api(&obj.gvk, ns.as_deref()).await?;

        let mut target = strip_noisy(obj.raw.clone());
        ensure_metadata(&mut target, &obj.name, ns.as_deref())?;
        let live = match api.get_opt(&obj.name).await.with_context(|| format!("reading {} {}", obj.gvk, obj.name))? {
            Some(o) => strip_noisy(serde_json::to_value(&o)?),
            None => Json::Null,
        };
        let summary = diff_summary(&target, &live);
        if live.is_null() {
            info!(kind = %obj.gvk, name = %obj.name, ns = ?ns, "recreating missing release resource");
        } else {
            debug!(kind = %obj.gvk, name = %obj.name, adds = summary.adds, updates = summary.updates, removes = summary.removes, "applying");
        }

        let pp = PatchParams::apply(&self.field_manager).force();
        api.patch(&obj.name, &pp, &Patch::Apply(&target))
            .await
            .map_err(|e| anyhow!("server-side apply of {} {} failed: {}", obj.gvk, obj.name, e))?;
        Ok(summary)
    }
}

#[async_trait::async_trait]
impl ManifestApplier for KubeApplier {
    async fn apply_manifest(&self, namespace: &str, manifest: &str) -> Result<()> {
        let t0 = Instant::now();
        let objects = match plan(manifest) {
            Ok(o) => o,
            Err(e) => {
                counter!("apply_err", 1u64);
                return Err(e);
            }
        };
        let mut changed = 0usize;
        for obj in &objects {
            match self.apply_one(namespace, obj).await {
                Ok(s) => {
                    if !s.is_empty() { changed += 1; }
                }
                Err(e) => {
                    counter!("apply_err", 1u64);
                    return Err(e);
                }
            }
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("apply_ok", 1u64);
        debug!(ns = %namespace, objects = objects.len(), changed, "manifest applied");
        Ok(())
    }
}

/// Parse a manifest for apply, rejecting oversized payloads.
pub fn plan(manifest: &str) -> Result<Vec<ManifestObject>> {
    let max = max_manifest_bytes();
    if manifest.len() > max {
        return Err(anyhow!("manifest too large ({} > {} bytes)", manifest.len(), max));
    }
    manifest::parse(manifest).context("parsing release manifest")
}

/// Namespace to apply into: the object's own, else the release namespace.
/// Cluster-scoped kinds get none.
pub fn target_namespace(obj: &ManifestObject, release_ns: &str, namespaced: bool) -> Option<String> {
    if !namespaced { return None; }
    Some(obj.namespace.clone().unwrap_or_else(|| release_ns.to_string()))
}

fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    // Server-populated.
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

fn ensure_metadata(v: &mut Json, name: &str, ns: Option<&str>) -> Result<()> {
    let root = v.as_object_mut().ok_or_else(|| anyhow!("manifest object {} is not a mapping", name))?;
    let meta = root.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
    let meta = meta.as_object_mut().ok_or_else(|| anyhow!("metadata of {} is not a mapping", name))?;
    meta.insert("name".into(), Json::String(name.to_string()));
    match ns {
        Some(ns) => { meta.insert("namespace".into(), Json::String(ns.to_string())); }
        None => { meta.remove("namespace"); }
    }
    Ok(())
}

/// Rough structural difference between a target object and a base.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (_, Json::Null) if !a.is_null() => s.adds += 1,
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}
