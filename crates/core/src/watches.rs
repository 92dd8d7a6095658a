//! Watches file: one entry per reconciled kind, each bound to a chart.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::annotations::AnnotationSets;
use crate::values::{parse_overrides, ValuesError};
use crate::{Chart, ChartError, Gvk, Values};

#[derive(Debug, thiserror::Error)]
pub enum WatchesError {
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("parsing watches: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("watch {index}: {reason}")]
    Invalid { index: usize, reason: String },
    #[error("duplicate watch for {0}")]
    Duplicate(Gvk),
    #[error("watch {index}: {source}")]
    Values { index: usize, source: ValuesError },
    #[error(transparent)]
    Chart(#[from] ChartError),
}

/// Raw watches file entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WatchEntry {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub chart: String,
    #[serde(default)]
    pub watch_dependent_resources: Option<bool>,
    #[serde(default)]
    pub override_values: BTreeMap<String, String>,
    #[serde(default, with = "humantime_serde")]
    pub reconcile_period: Option<Duration>,
    #[serde(default)]
    pub max_concurrent_reconciles: Option<usize>,
}

/// Process-wide defaults applied when an entry leaves a setting out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchDefaults {
    pub reconcile_period: Duration,
    pub max_concurrent_reconciles: usize,
}

impl Default for WatchDefaults {
    fn default() -> Self { Self { reconcile_period: Duration::ZERO, max_concurrent_reconciles: 1 } }
}

/// Immutable per-kind configuration. One reconciler is built per descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchDescriptor {
    pub gvk: Gvk,
    pub chart: Chart,
    pub override_values: Values,
    /// Zero disables periodic resync.
    pub reconcile_period: Duration,
    pub max_concurrent_reconciles: usize,
    pub watch_dependent_resources: bool,
    pub annotations: AnnotationSets,
}

impl WatchDescriptor {
    pub fn new(gvk: Gvk, chart: Chart) -> Self {
        Self {
            gvk,
            chart,
            override_values: Values::new(),
            reconcile_period: Duration::ZERO,
            max_concurrent_reconciles: 1,
            watch_dependent_resources: true,
            annotations: AnnotationSets::defaults(),
        }
    }
}

/// Parse and validate watches YAML without touching charts on disk.
pub fn parse_entries(yaml: &str) -> Result<Vec<WatchEntry>, WatchesError> {
    let mut entries: Vec<WatchEntry> = serde_yaml::from_str(yaml)?;
    let mut seen = BTreeSet::new();
    for (index, e) in entries.iter_mut().enumerate() {
        if e.version.is_empty() { return Err(WatchesError::Invalid { index, reason: "version must not be empty".into() }); }
        if e.kind.is_empty() { return Err(WatchesError::Invalid { index, reason: "kind must not be empty".into() }); }
        if e.chart.is_empty() { return Err(WatchesError::Invalid { index, reason: "chart must not be empty".into() }); }
        if e.max_concurrent_reconciles == Some(0) {
            return Err(WatchesError::Invalid { index, reason: "maxConcurrentReconciles must be positive".into() });
        }
        let gvk = Gvk::new(e.group.clone(), e.version.clone(), e.kind.clone());
        if !seen.insert(gvk.clone()) { return Err(WatchesError::Duplicate(gvk)); }
        for v in e.override_values.values_mut() { *v = expand_env(v); }
    }
    Ok(entries)
}

impl WatchEntry {
    pub fn gvk(&self) -> Gvk { Gvk::new(self.group.clone(), self.version.clone(), self.kind.clone()) }

    pub fn into_descriptor(self, index: usize, defaults: &WatchDefaults) -> Result<WatchDescriptor, WatchesError> {
        let gvk = self.gvk();
        let chart = Chart::load(Path::new(&self.chart))?;
        let override_values = parse_overrides(&self.override_values).map_err(|source| WatchesError::Values { index, source })?;
        Ok(WatchDescriptor {
            gvk,
            chart,
            override_values,
            reconcile_period: self.reconcile_period.unwrap_or(defaults.reconcile_period),
            max_concurrent_reconciles: self.max_concurrent_reconciles.unwrap_or(defaults.max_concurrent_reconciles),
            watch_dependent_resources: self.watch_dependent_resources.unwrap_or(true),
            annotations: AnnotationSets::defaults(),
        })
    }
}

/// Load a watches file and resolve every entry into a descriptor.
pub fn load(path: &Path, defaults: &WatchDefaults) -> Result<Vec<WatchDescriptor>, WatchesError> {
    let raw = std::fs::read_to_string(path).map_err(|source| WatchesError::Io { path: path.to_path_buf(), source })?;
    let entries = parse_entries(&raw)?;
    debug!(path = %path.display(), count = entries.len(), "watches parsed");
    entries.into_iter().enumerate().map(|(i, e)| e.into_descriptor(i, defaults)).collect()
}

static ENV_REF: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").ok());

/// `$VAR` / `${VAR}` expansion; unset variables expand to the empty string.
fn expand_env(s: &str) -> String {
    if !s.contains('$') { return s.to_string(); }
    let Some(re) = ENV_REF.as_ref() else { return s.to_string() };
    re.replace_all(s, |caps: &regex::Captures<'_>| {
        let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or("");
        std::env::var(name).unwrap_or_default()
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chart_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Chart.yaml"), "apiVersion: v2\nname: memcached\nversion: 0.1.0\n").unwrap();
        dir
    }

    #[test]
    fn load_applies_defaults_and_entry_overrides() {
        let chart = chart_dir();
        let yaml = format!(
            r#"
- group: cache.example.com
  version: v1alpha1
  kind: Memcached
  chart: {chart}
- group: cache.example.com
  version: v1alpha1
  kind: MemcachedBackup
  chart: {chart}
  watchDependentResources: false
  reconcilePeriod: 30s
  maxConcurrentReconciles: 4
  overrideValues:
    image.repository: quay.io/example/memcached
"#,
            chart = chart.path().display()
        );
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), yaml).unwrap();
        let defaults = WatchDefaults { reconcile_period: Duration::from_secs(60), max_concurrent_reconciles: 2 };
        let ws = load(file.path(), &defaults).unwrap();
        assert_eq!(ws.len(), 2);

        assert_eq!(ws[0].gvk.key(), "cache.example.com/v1alpha1/Memcached");
        assert_eq!(ws[0].reconcile_period, Duration::from_secs(60));
        assert_eq!(ws[0].max_concurrent_reconciles, 2);
        assert!(ws[0].watch_dependent_resources);
        assert_eq!(ws[0].chart.name, "memcached");

        assert_eq!(ws[1].reconcile_period, Duration::from_secs(30));
        assert_eq!(ws[1].max_concurrent_reconciles, 4);
        assert!(!ws[1].watch_dependent_resources);
        assert_eq!(
            serde_json::Value::Object(ws[1].override_values.clone()),
            serde_json::json!({"image": {"repository": "quay.io/example/memcached"}})
        );
    }

    #[test]
    fn parse_rejects_missing_fields_and_duplicates() {
        let e = parse_entries("- version: v1\n  chart: c\n").unwrap_err().to_string();
        assert!(e.contains("kind must not be empty"), "e={}", e);

        let dup = "- {version: v1, kind: A, chart: c}\n- {version: v1, kind: A, chart: d}\n";
        assert!(matches!(parse_entries(dup), Err(WatchesError::Duplicate(_))));

        let zero = "- {version: v1, kind: A, chart: c, maxConcurrentReconciles: 0}\n";
        assert!(matches!(parse_entries(zero), Err(WatchesError::Invalid { .. })));

        assert!(matches!(parse_entries("- {version: v1, kind: A, chart: c, bogus: 1}\n"), Err(WatchesError::Parse(_))));
    }

    #[test]
    fn override_values_expand_environment() {
        std::env::set_var("KEEL_TEST_IMAGE_TAG", "1.6");
        let yaml = "- version: v1\n  kind: A\n  chart: c\n  overrideValues:\n    image.tag: ${KEEL_TEST_IMAGE_TAG}-alpine\n    other: $KEEL_TEST_UNSET_VARIABLE\n";
        let entries = parse_entries(yaml).unwrap();
        assert_eq!(entries[0].override_values["image.tag"], "1.6-alpine");
        assert_eq!(entries[0].override_values["other"], "");
    }

    #[test]
    fn env_pattern_compiles_once() {
        let first = ENV_REF.as_ref().map(|r| r as *const Regex);
        assert!(first.is_some());
        std::env::set_var("KEEL_TEST_REPEAT", "x");
        for _ in 0..3 { assert_eq!(expand_env("$KEEL_TEST_REPEAT/${KEEL_TEST_REPEAT}"), "x/x"); }
        assert_eq!(ENV_REF.as_ref().map(|r| r as *const Regex), first);
        assert_eq!(expand_env("no vars"), "no vars");
    }

    #[test]
    fn missing_chart_dir_fails_to_load() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "- {version: v1, kind: A, chart: /definitely/not/here}\n").unwrap();
        assert!(matches!(load(file.path(), &WatchDefaults::default()), Err(WatchesError::Chart(_))));
    }
}
