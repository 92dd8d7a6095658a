//! Values resolution: layered deep merge, override paths, and fingerprints.

use std::collections::BTreeMap;

use serde_json::Value as Json;
use sha2::{Digest, Sha256};

use crate::{ManagedObject, Values};

#[derive(Debug, thiserror::Error)]
pub enum ValuesError {
    #[error("spec must be an object, found {0}")]
    SpecNotObject(&'static str),
    #[error("invalid override path {0:?}")]
    InvalidPath(String),
}

/// Deep merge `overrides` on top of `base`.
///
/// Maps are unioned; on conflict the override wins, recursing only when both
/// sides are maps. A non-map override replaces a map outright and vice versa.
pub fn merge(base: &Values, overrides: &Values) -> Values {
    let mut out = base.clone();
    for (k, over) in overrides.iter() {
        let merged = match (out.get(k), over) {
            (Some(Json::Object(b)), Json::Object(o)) => Json::Object(merge(b, o)),
            _ => over.clone(),
        };
        out.insert(k.clone(), merged);
    }
    out
}

/// Content fingerprint of a values tree. Independent of key order.
pub fn fingerprint(values: &Values) -> String {
    let canonical = canonicalize(&Json::Object(values.clone()));
    // Serializing a Value cannot fail; fall back to Debug to keep this total.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_else(|_| format!("{:?}", canonical).into_bytes());
    let digest = Sha256::digest(&bytes);
    format!("sha256:{}", hex::encode(digest))
}

fn canonicalize(v: &Json) -> Json {
    match v {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                if let Some(child) = map.get(k) { out.insert(k.clone(), canonicalize(child)); }
            }
            Json::Object(out)
        }
        Json::Array(items) => Json::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Expand dotted override paths (`image.repository` -> `{image: {repository: ..}}`).
///
/// Scalars are typed the way a command line `--set` would: booleans, numbers
/// and `null` are recognized, everything else stays a string.
pub fn parse_overrides(raw: &BTreeMap<String, String>) -> Result<Values, ValuesError> {
    let mut out = Values::new();
    for (path, value) in raw.iter() {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| s.trim().is_empty()) {
            return Err(ValuesError::InvalidPath(path.clone()));
        }
        insert_path(&mut out, &segments, typed_scalar(value));
    }
    Ok(out)
}

fn insert_path(map: &mut Values, segments: &[&str], value: Json) {
    match segments {
        [] => {}
        [last] => { map.insert((*last).to_string(), value); }
        [head, rest @ ..] => {
            let entry = map.entry((*head).to_string()).or_insert_with(|| Json::Object(Values::new()));
            if !entry.is_object() { *entry = Json::Object(Values::new()); }
            if let Json::Object(child) = entry { insert_path(child, rest, value); }
        }
    }
}

fn typed_scalar(s: &str) -> Json {
    match s {
        "true" => return Json::Bool(true),
        "false" => return Json::Bool(false),
        "null" => return Json::Null,
        _ => {}
    }
    if let Ok(i) = s.parse::<i64>() { return Json::from(i); }
    if let Ok(f) = s.parse::<f64>() {
        if f.is_finite() && s.contains('.') {
            if let Some(n) = serde_json::Number::from_f64(f) { return Json::Number(n); }
        }
    }
    Json::String(s.to_string())
}

/// The result of resolving values for one reconcile.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedValues {
    pub values: Values,
    pub fingerprint: String,
}

/// Resolves the final values for a managed object: descriptor overrides on top of `.spec`.
#[derive(Debug, Clone, Default)]
pub struct ValuesResolver {
    overrides: Values,
}

impl ValuesResolver {
    pub fn new(overrides: Values) -> Self { Self { overrides } }

    pub fn overrides(&self) -> &Values { &self.overrides }

    pub fn resolve(&self, obj: &ManagedObject) -> Result<ResolvedValues, ValuesError> {
        let spec = match &obj.spec {
            Json::Null => Values::new(),
            Json::Object(m) => m.clone(),
            Json::Bool(_) => return Err(ValuesError::SpecNotObject("bool")),
            Json::Number(_) => return Err(ValuesError::SpecNotObject("number")),
            Json::String(_) => return Err(ValuesError::SpecNotObject("string")),
            Json::Array(_) => return Err(ValuesError::SpecNotObject("array")),
        };
        let values = merge(&spec, &self.overrides);
        let fingerprint = fingerprint(&values);
        Ok(ResolvedValues { values, fingerprint })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Gvk, ObjectKey};
    use serde_json::json;

    fn map(v: Json) -> Values {
        match v { Json::Object(m) => m, _ => panic!("not a map") }
    }

    #[test]
    fn merge_unions_nested_maps() {
        let base = map(json!({"a": 1, "b": {"x": 1}}));
        let over = map(json!({"b": {"y": 2}, "c": 3}));
        assert_eq!(Json::Object(merge(&base, &over)), json!({"a": 1, "b": {"x": 1, "y": 2}, "c": 3}));
    }

    #[test]
    fn merge_scalar_override_replaces_map() {
        let base = map(json!({"a": {"x": 1}}));
        let over = map(json!({"a": 5}));
        assert_eq!(Json::Object(merge(&base, &over)), json!({"a": 5}));
    }

    #[test]
    fn merge_map_override_replaces_scalar() {
        let base = map(json!({"a": 5, "keep": [1, 2]}));
        let over = map(json!({"a": {"x": 1}}));
        assert_eq!(Json::Object(merge(&base, &over)), json!({"a": {"x": 1}, "keep": [1, 2]}));
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = map(json!({"a": 1, "b": {"x": 1, "y": [1, {"q": 1, "p": 2}]}}));
        let mut b = Values::new();
        b.insert("b".into(), json!({"y": [1, {"p": 2, "q": 1}], "x": 1}));
        b.insert("a".into(), json!(1));
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert!(fingerprint(&a).starts_with("sha256:"));

        let c = map(json!({"a": 2, "b": {"x": 1, "y": [1, {"q": 1, "p": 2}]}}));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn parse_overrides_builds_typed_tree() {
        let mut raw = BTreeMap::new();
        raw.insert("image.repository".to_string(), "quay.io/example/nginx".to_string());
        raw.insert("image.tag".to_string(), "1.21".to_string());
        raw.insert("replicaCount".to_string(), "3".to_string());
        raw.insert("service.enabled".to_string(), "false".to_string());
        raw.insert("extra".to_string(), "null".to_string());
        let v = parse_overrides(&raw).unwrap();
        assert_eq!(
            Json::Object(v),
            json!({
                "image": {"repository": "quay.io/example/nginx", "tag": 1.21},
                "replicaCount": 3,
                "service": {"enabled": false},
                "extra": null
            })
        );
    }

    #[test]
    fn parse_overrides_rejects_empty_segments() {
        let mut raw = BTreeMap::new();
        raw.insert("image..tag".to_string(), "x".to_string());
        assert!(matches!(parse_overrides(&raw), Err(ValuesError::InvalidPath(_))));
    }

    #[test]
    fn resolver_puts_overrides_above_spec() {
        let key = ObjectKey::new(Gvk::new("g", "v1", "K"), Some("ns"), "a");
        let obj = ManagedObject::new(key.clone(), json!({"replicaCount": 1, "image": {"tag": "dev"}}));
        let r = ValuesResolver::new(map(json!({"image": {"repository": "pinned"}, "replicaCount": 2})));
        let resolved = r.resolve(&obj).unwrap();
        assert_eq!(Json::Object(resolved.values.clone()), json!({"replicaCount": 2, "image": {"tag": "dev", "repository": "pinned"}}));
        assert_eq!(resolved.fingerprint, fingerprint(&resolved.values));

        let empty = ManagedObject::new(key.clone(), Json::Null);
        assert!(r.resolve(&empty).is_ok());
        let bad = ManagedObject::new(key, json!([1, 2]));
        assert!(matches!(r.resolve(&bad), Err(ValuesError::SpecNotObject("array"))));
    }
}
