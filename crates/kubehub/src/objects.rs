//! [`ObjectClient`] backed by the API server.

use std::sync::Arc;
use std::time::Instant;

use keel_core::{Gvk, ManagedObject, ObjectKey};
use keel_reconciler::{ObjectClient, ObjectError};
use kube::api::{Api, Patch, PatchParams};
use kube::core::DynamicObject;
use metrics::{counter, histogram};

use crate::convert::{metadata_patch, status_patch, to_managed};
use crate::discovery::ApiResolver;

pub fn map_kube_error(key: &ObjectKey, e: kube::Error) -> ObjectError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => ObjectError::NotFound(key.to_string()),
        kube::Error::Api(ae) if ae.code == 409 => ObjectError::Conflict(key.to_string()),
        other => ObjectError::Api(other.to_string()),
    }
}

/// Reads and patches objects of one kind. Reads go to the API server, not a cache.
pub struct KubeObjectClient {
    resolver: Arc<ApiResolver>,
    gvk: Gvk,
}

impl KubeObjectClient {
    pub fn new(resolver: Arc<ApiResolver>, gvk: Gvk) -> Self { Self { resolver, gvk } }

    async fn api(&self, key: &ObjectKey) -> Result<Api<DynamicObject>, ObjectError> {
        self.resolver
            .api(&self.gvk, key.namespace.as_deref())
            .await
            .map_err(|e| ObjectError::Api(format!("{:#}", e)))
    }

    fn convert(&self, key: &ObjectKey, obj: DynamicObject) -> Result<ManagedObject, ObjectError> {
        to_managed(&self.gvk, &obj).ok_or_else(|| ObjectError::Api(format!("{}: response without metadata.name", key)))
    }

    fn observe<T>(op: &'static str, t0: Instant, res: &Result<T, kube::Error>) {
        histogram!("kube_call_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
        if res.is_err() { counter!("kube_call_errors_total", 1u64, "op" => op); }
    }
}

#[async_trait::async_trait]
impl ObjectClient for KubeObjectClient {
    async fn get(&self, key: &ObjectKey) -> Result<ManagedObject, ObjectError> {
        let api = self.api(key).await?;
        let t0 = Instant::now();
        let res = api.get(&key.name).await;
        Self::observe("get", t0, &res);
        let obj = res.map_err(|e| map_kube_error(key, e))?;
        self.convert(key, obj)
    }

    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject, ObjectError> {
        let api = self.api(&obj.key).await?;
        let t0 = Instant::now();
        let patch = metadata_patch(obj);
        let res = api.patch(&obj.key.name, &PatchParams::default(), &Patch::Merge(&patch)).await;
        Self::observe("update", t0, &res);
        let out = res.map_err(|e| map_kube_error(&obj.key, e))?;
        self.convert(&obj.key, out)
    }

    async fn update_status(&self, obj: &ManagedObject) -> Result<ManagedObject, ObjectError> {
        let api = self.api(&obj.key).await?;
        let t0 = Instant::now();
        let patch = status_patch(obj);
        let res = api.patch_status(&obj.key.name, &PatchParams::default(), &Patch::Merge(&patch)).await;
        Self::observe("update_status", t0, &res);
        let out = res.map_err(|e| map_kube_error(&obj.key, e))?;
        self.convert(&obj.key, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "x".into(), reason: "x".into(), code })
    }

    #[test]
    fn status_codes_map_to_object_errors() {
        let key = ObjectKey::new(Gvk::new("x.io", "v1", "App"), Some("ns"), "a");
        assert!(map_kube_error(&key, api_err(404)).is_not_found());
        assert!(map_kube_error(&key, api_err(409)).is_conflict());
        assert!(matches!(map_kube_error(&key, api_err(500)), ObjectError::Api(_)));
    }
}
