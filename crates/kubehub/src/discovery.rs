//! API resource resolution via kube discovery, cached per GVK.

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use keel_core::Gvk;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::histogram;
use rustc_hash::FxHashMap;
use tracing::debug;

pub struct ApiResolver {
    client: Client,
    cache: Mutex<FxHashMap<Gvk, (ApiResource, bool)>>,
}

impl ApiResolver {
    pub fn new(client: Client) -> Self { Self { client, cache: Mutex::new(FxHashMap::default()) } }

    pub fn client(&self) -> &Client { &self.client }

    /// The served resource for `gvk` and whether it is namespaced.
    pub async fn resolve(&self, gvk: &Gvk) -> Result<(ApiResource, bool)> {
        if let Some(hit) = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(gvk).cloned() {
            return Ok(hit);
        }
        let t0 = Instant::now();
        let discovery = Discovery::new(self.client.clone())
            .filter(&[gvk.group.as_str()])
            .run()
            .await
            .with_context(|| format!("discovering {}", gvk))?;
        histogram!("discovery_ms", t0.elapsed().as_secs_f64() * 1000.0);
        for group in discovery.groups() {
            for (ar, caps) in group.versioned_resources(&gvk.version) {
                if ar.kind != gvk.kind { continue; }
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                debug!(gvk = %gvk, plural = %ar.plural, namespaced, "api resource resolved");
                self.cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(gvk.clone(), (ar.clone(), namespaced));
                return Ok((ar, namespaced));
            }
        }
        Err(anyhow!("GVK not served: {}", gvk))
    }

    /// Dynamic API for `gvk`, scoped to `namespace` when the kind is namespaced.
    pub async fn api(&self, gvk: &Gvk, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve(gvk).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }
}
