//! Keel core types: object keys, managed objects, releases and charts.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod annotations;
pub mod manifest;
pub mod values;
pub mod watches;

/// Merged chart values. Always a map at the top level.
pub type Values = serde_json::Map<String, serde_json::Value>;

/// Finalizer placed on every managed object so uninstall always runs before removal.
pub const UNINSTALL_FINALIZER: &str = "keel.sh/uninstall-release";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Split an `apiVersion` such as `apps/v1` or `v1` into group and version.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Key form `v1/Kind` or `group/v1/Kind`.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn parse_key(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Some(Self::new("", *version, *kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Some(Self::new(*group, *version, *kind)),
            _ => None,
        }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.key()) }
}

/// Identity of a managed object: GVK plus namespace/name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(gvk: Gvk, namespace: Option<&str>, name: &str) -> Self {
        Self { gvk, namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    /// Release name derived from the object. Deterministic: the object name.
    pub fn release_name(&self) -> &str { &self.name }

    /// Namespace the release is installed into.
    pub fn release_namespace(&self) -> &str { self.namespace.as_deref().unwrap_or("default") }

    /// Lock key for the release owned by this object.
    pub fn release_key(&self) -> String { format!("{}/{}", self.release_namespace(), self.release_name()) }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk, ns, self.name),
            None => write!(f, "{} {}", self.gvk, self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Initialized,
    Deployed,
    ReleaseFailed,
    Irreconcilable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(type_: ConditionType, status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            type_,
            status,
            reason: Some(reason.to_string()),
            message: if message.is_empty() { None } else { Some(message) },
            last_transition_time: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedRelease {
    pub name: String,
    pub manifest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStatus {
    #[serde(default)]
    pub conditions: SmallVec<[Condition; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_release: Option<DeployedRelease>,
}

impl ObjectStatus {
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Insert or replace a condition. The transition time only moves when the status flips.
    pub fn set_condition(&mut self, mut cond: Condition) {
        match self.conditions.iter_mut().find(|c| c.type_ == cond.type_) {
            Some(existing) => {
                if existing.status == cond.status {
                    cond.last_transition_time = existing.last_transition_time;
                }
                *existing = cond;
            }
            None => self.conditions.push(cond),
        }
    }

    pub fn remove_condition(&mut self, type_: ConditionType) {
        self.conditions.retain(|c| c.type_ != type_);
    }
}

/// The custom resource being reconciled, reduced to what the engine reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedObject {
    pub key: ObjectKey,
    pub uid: Option<String>,
    pub generation: Option<i64>,
    pub resource_version: Option<String>,
    pub finalizers: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// The embedded values (`.spec`).
    pub spec: serde_json::Value,
    pub status: ObjectStatus,
}

impl ManagedObject {
    pub fn new(key: ObjectKey, spec: serde_json::Value) -> Self {
        Self {
            key,
            uid: None,
            generation: None,
            resource_version: None,
            finalizers: Vec::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            deletion_timestamp: None,
            spec,
            status: ObjectStatus::default(),
        }
    }

    pub fn is_deleting(&self) -> bool { self.deletion_timestamp.is_some() }

    pub fn has_finalizer(&self, finalizer: &str) -> bool { self.finalizers.iter().any(|f| f == finalizer) }

    /// Returns true when the finalizer was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) { return false; }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns true when the finalizer was present and removed.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> { self.annotations.get(key).map(|s| s.as_str()) }
}

/// Lifecycle status of a release as reported by the packaging subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    Deployed,
    Failed,
    Superseded,
    Uninstalled,
    Uninstalling,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub chart_name: String,
    pub chart_version: String,
    pub values: Values,
    pub manifest: String,
    pub revision: i64,
    pub status: ReleaseStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum ChartError {
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("parsing {path}: {source}")]
    Parse { path: PathBuf, source: serde_yaml::Error },
    #[error("{path}: missing {field}")]
    MissingField { path: PathBuf, field: &'static str },
}

/// Chart reference: where it lives and the identity declared in its `Chart.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chart {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
}

impl Chart {
    /// Load chart identity from `<dir>/Chart.yaml`.
    pub fn load(dir: &Path) -> Result<Self, ChartError> {
        #[derive(Deserialize)]
        struct ChartMeta {
            name: Option<String>,
            version: Option<String>,
        }
        let path = dir.join("Chart.yaml");
        let raw = std::fs::read_to_string(&path).map_err(|source| ChartError::Io { path: path.clone(), source })?;
        let meta: ChartMeta = serde_yaml::from_str(&raw).map_err(|source| ChartError::Parse { path: path.clone(), source })?;
        let name = meta.name.filter(|s| !s.is_empty()).ok_or_else(|| ChartError::MissingField { path: path.clone(), field: "name" })?;
        let version = meta.version.filter(|s| !s.is_empty()).ok_or_else(|| ChartError::MissingField { path: path.clone(), field: "version" })?;
        Ok(Self { name, version, path: dir.to_path_buf() })
    }
}

pub mod prelude {
    pub use super::{
        Chart, Condition, ConditionStatus, ConditionType, Gvk, ManagedObject, ObjectKey, ObjectStatus, Release,
        ReleaseStatus, Values, UNINSTALL_FINALIZER,
    };
}
