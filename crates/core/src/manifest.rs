//! Rendered release manifests: multi-document YAML split into resource objects.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::Value as Json;

use crate::Gvk;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("document {index}: {source}")]
    Yaml { index: usize, source: serde_yaml::Error },
    #[error("document {index}: converting YAML to JSON: {source}")]
    Json { index: usize, source: serde_json::Error },
    #[error("document {index}: missing {field}")]
    MissingField { index: usize, field: &'static str },
}

/// One resource object from a manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestObject {
    pub gvk: Gvk,
    pub name: String,
    pub namespace: Option<String>,
    pub raw: Json,
}

/// Split a manifest into its resource objects.
///
/// Empty documents (comment-only templates) are skipped and `*List` kinds are
/// flattened into their items.
pub fn parse(manifest: &str) -> Result<Vec<ManifestObject>, ManifestError> {
    let mut out = Vec::new();
    for (index, doc) in serde_yaml::Deserializer::from_str(manifest).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).map_err(|source| ManifestError::Yaml { index, source })?;
        if val.is_null() { continue; }
        let json = serde_json::to_value(val).map_err(|source| ManifestError::Json { index, source })?;
        collect(index, json, &mut out)?;
    }
    Ok(out)
}

fn collect(index: usize, json: Json, out: &mut Vec<ManifestObject>) -> Result<(), ManifestError> {
    let api_version = json.get("apiVersion").and_then(|v| v.as_str()).ok_or(ManifestError::MissingField { index, field: "apiVersion" })?;
    let kind = json.get("kind").and_then(|v| v.as_str()).ok_or(ManifestError::MissingField { index, field: "kind" })?;
    if kind.ends_with("List") {
        if let Some(items) = json.get("items").and_then(|v| v.as_array()) {
            for item in items.iter().cloned() { collect(index, item, out)?; }
            return Ok(());
        }
    }
    let gvk = Gvk::from_api_version(api_version, kind);
    let meta = json.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .ok_or(ManifestError::MissingField { index, field: "metadata.name" })?
        .to_string();
    let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).map(|s| s.to_string());
    out.push(ManifestObject { gvk, name, namespace, raw: json });
    Ok(())
}

/// Distinct kinds present in a manifest.
pub fn kinds(manifest: &str) -> Result<BTreeSet<Gvk>, ManifestError> {
    Ok(parse(manifest)?.into_iter().map(|o| o.gvk).collect())
}
