//! Mapping between `DynamicObject` and the engine's object model.

use keel_core::{Gvk, ManagedObject, ObjectKey, ObjectStatus};
use kube::core::DynamicObject;
use tracing::debug;

pub fn object_key(gvk: &Gvk, obj: &DynamicObject) -> Option<ObjectKey> {
    let name = obj.metadata.name.as_deref()?;
    Some(ObjectKey::new(gvk.clone(), obj.metadata.namespace.as_deref(), name))
}

/// Reduce a live object to what the reconciler reads. An unparseable status is treated as empty.
pub fn to_managed(gvk: &Gvk, obj: &DynamicObject) -> Option<ManagedObject> {
    let key = object_key(gvk, obj)?;
    let meta = &obj.metadata;
    let spec = obj.data.get("spec").cloned().unwrap_or(serde_json::Value::Null);
    let status = match obj.data.get("status") {
        Some(raw) if !raw.is_null() => serde_json::from_value::<ObjectStatus>(raw.clone()).unwrap_or_else(|e| {
            debug!(object = %key, error = %e, "ignoring unparseable status");
            ObjectStatus::default()
        }),
        _ => ObjectStatus::default(),
    };
    let mut out = ManagedObject::new(key, spec);
    out.uid = meta.uid.clone();
    out.generation = meta.generation;
    out.resource_version = meta.resource_version.clone();
    out.finalizers = meta.finalizers.clone().unwrap_or_default();
    out.labels = meta.labels.clone().unwrap_or_default();
    out.annotations = meta.annotations.clone().unwrap_or_default();
    out.deletion_timestamp = meta.deletion_timestamp.as_ref().map(|t| t.0);
    out.status = status;
    Some(out)
}

/// Merge patch for metadata writes. The resource version makes it a conditional write.
pub fn metadata_patch(obj: &ManagedObject) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "resourceVersion": obj.resource_version,
            "finalizers": obj.finalizers,
            "labels": obj.labels,
            "annotations": obj.annotations,
        }
    })
}

pub fn status_patch(obj: &ManagedObject) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "resourceVersion": obj.resource_version },
        "status": obj.status,
    })
}

/// Helm's ownership annotations on rendered resources.
pub const HELM_RELEASE_NAME: &str = "meta.helm.sh/release-name";
pub const HELM_RELEASE_NAMESPACE: &str = "meta.helm.sh/release-namespace";

/// Owner keys a child object points back to, by owner reference or Helm annotations.
///
/// Keys of a cluster-scoped owner kind carry no namespace, matching [`object_key`].
pub fn owners_of(child: &DynamicObject, owner: &Gvk, owner_namespaced: bool) -> Vec<ObjectKey> {
    let meta = &child.metadata;
    let api_version = owner.api_version();
    let mut out: Vec<ObjectKey> = meta
        .owner_references
        .iter()
        .flatten()
        .filter(|r| r.api_version == api_version && r.kind == owner.kind)
        .filter_map(|r| owner_namespace(meta.namespace.as_deref(), owner_namespaced).map(|ns| ObjectKey::new(owner.clone(), ns, &r.name)))
        .collect();
    if out.is_empty() {
        let ann = meta.annotations.as_ref();
        let name = ann.and_then(|a| a.get(HELM_RELEASE_NAME));
        let ns = ann.and_then(|a| a.get(HELM_RELEASE_NAMESPACE)).map(|s| s.as_str());
        if let (Some(name), Some(ns)) = (name, owner_namespace(ns, owner_namespaced)) {
            out.push(ObjectKey::new(owner.clone(), ns, name));
        }
    }
    out.sort();
    out.dedup();
    out
}

/// `None` when a namespaced owner has no namespace to take; `Some(None)` for cluster-scoped owners.
fn owner_namespace(ns: Option<&str>, owner_namespaced: bool) -> Option<Option<&str>> {
    if owner_namespaced { ns.map(Some) } else { Some(None) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ConditionType, UNINSTALL_FINALIZER};

    fn owner() -> Gvk { Gvk::new("apps.example.com", "v1", "Nginx") }

    fn dynamic(v: serde_json::Value) -> DynamicObject { serde_json::from_value(v).unwrap() }

    #[test]
    fn live_object_maps_to_managed() {
        let obj = dynamic(serde_json::json!({
            "apiVersion": "apps.example.com/v1",
            "kind": "Nginx",
            "metadata": {
                "name": "web",
                "namespace": "prod",
                "uid": "0b6c",
                "generation": 3,
                "resourceVersion": "991",
                "finalizers": [UNINSTALL_FINALIZER],
                "annotations": {"keel.sh/last-action": "install"},
                "deletionTimestamp": "2024-01-02T03:04:05Z"
            },
            "spec": {"replicaCount": 2},
            "status": {"conditions": [{"type": "Deployed", "status": "True"}]}
        }));
        let m = to_managed(&owner(), &obj).unwrap();
        assert_eq!(m.key, ObjectKey::new(owner(), Some("prod"), "web"));
        assert_eq!(m.generation, Some(3));
        assert_eq!(m.resource_version.as_deref(), Some("991"));
        assert!(m.has_finalizer(UNINSTALL_FINALIZER));
        assert!(m.is_deleting());
        assert_eq!(m.spec["replicaCount"], 2);
        assert!(m.status.condition(ConditionType::Deployed).is_some());
        assert_eq!(m.annotation("keel.sh/last-action"), Some("install"));
    }

    #[test]
    fn garbage_status_is_ignored() {
        let obj = dynamic(serde_json::json!({
            "apiVersion": "apps.example.com/v1",
            "kind": "Nginx",
            "metadata": {"name": "web", "namespace": "prod"},
            "status": {"conditions": "nope"}
        }));
        let m = to_managed(&owner(), &obj).unwrap();
        assert!(m.status.conditions.is_empty());
        assert!(m.spec.is_null());
    }

    #[test]
    fn patches_carry_resource_version() {
        let mut m = ManagedObject::new(ObjectKey::new(owner(), Some("prod"), "web"), serde_json::json!({}));
        m.resource_version = Some("7".into());
        m.add_finalizer(UNINSTALL_FINALIZER);
        let p = metadata_patch(&m);
        assert_eq!(p["metadata"]["resourceVersion"], "7");
        assert_eq!(p["metadata"]["finalizers"][0], UNINSTALL_FINALIZER);
        assert_eq!(status_patch(&m)["metadata"]["resourceVersion"], "7");
    }

    #[test]
    fn owners_from_references_then_annotations() {
        let by_ref = dynamic(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "web-config",
                "namespace": "prod",
                "ownerReferences": [
                    {"apiVersion": "apps.example.com/v1", "kind": "Nginx", "name": "web", "uid": "u1"},
                    {"apiVersion": "apps/v1", "kind": "Deployment", "name": "other", "uid": "u2"}
                ]
            }
        }));
        assert_eq!(owners_of(&by_ref, &owner(), true), vec![ObjectKey::new(owner(), Some("prod"), "web")]);

        let by_ann = dynamic(serde_json::json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": {
                "name": "web-reader",
                "annotations": {"meta.helm.sh/release-name": "web", "meta.helm.sh/release-namespace": "prod"}
            }
        }));
        assert_eq!(owners_of(&by_ann, &owner(), true), vec![ObjectKey::new(owner(), Some("prod"), "web")]);

        let orphan = dynamic(serde_json::json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "x", "namespace": "prod"}}));
        assert!(owners_of(&orphan, &owner(), true).is_empty());
    }

    #[test]
    fn cluster_scoped_owner_keys_have_no_namespace() {
        let cluster = Gvk::new("platform.example.com", "v1", "Tenant");
        let by_ann = dynamic(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "acme-config",
                "namespace": "default",
                "annotations": {"meta.helm.sh/release-name": "acme", "meta.helm.sh/release-namespace": "default"}
            }
        }));
        let want = vec![ObjectKey::new(cluster.clone(), None, "acme")];
        assert_eq!(owners_of(&by_ann, &cluster, false), want);

        let by_ref = dynamic(serde_json::json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": {
                "name": "acme-reader",
                "ownerReferences": [{"apiVersion": "platform.example.com/v1", "kind": "Tenant", "name": "acme", "uid": "u1"}]
            }
        }));
        assert_eq!(owners_of(&by_ref, &cluster, false), want);

        let obj = dynamic(serde_json::json!({"apiVersion": "platform.example.com/v1", "kind": "Tenant", "metadata": {"name": "acme"}}));
        assert_eq!(object_key(&cluster, &obj), Some(want[0].clone()));
    }
}
