//! Action client that drives the `helm` binary.
//!
//! Release state lives wherever helm keeps it (Secrets by default); this
//! client only shells out and parses `--output json`. Child processes are
//! killed when the call future is dropped, so a cancelled reconcile never
//! leaves a helm process running behind it.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use keel_core::annotations::ActionOptions;
use keel_core::{Chart, ManagedObject, Release, ReleaseStatus, Values};
use metrics::{counter, histogram};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::{ActionClient, ActionClientGetter, ActionError, Operation, UninstallResult};

/// Applies a rendered manifest to the cluster (server-side apply). Used for drift correction.
#[async_trait::async_trait]
pub trait ManifestApplier: Send + Sync {
    async fn apply_manifest(&self, namespace: &str, manifest: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
struct HelmRelease {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    version: i64,
    #[serde(default)]
    manifest: String,
    #[serde(default)]
    config: Option<Values>,
    #[serde(default)]
    info: Option<HelmInfo>,
    #[serde(default)]
    chart: Option<HelmChart>,
}

#[derive(Debug, Deserialize)]
struct HelmInfo {
    status: ReleaseStatus,
}

#[derive(Debug, Deserialize)]
struct HelmChart {
    #[serde(default)]
    metadata: Option<HelmChartMeta>,
}

#[derive(Debug, Default, Deserialize)]
struct HelmChartMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
}

impl From<HelmRelease> for Release {
    fn from(h: HelmRelease) -> Self {
        let meta = h.chart.and_then(|c| c.metadata).unwrap_or_default();
        Release {
            name: h.name,
            namespace: h.namespace,
            chart_name: meta.name,
            chart_version: meta.version,
            values: h.config.unwrap_or_default(),
            manifest: h.manifest,
            revision: h.version,
            status: h.info.map(|i| i.status).unwrap_or(ReleaseStatus::Unknown),
        }
    }
}

fn parse_release(op: Operation, name: &str, stdout: &[u8]) -> Result<Release, ActionError> {
    let h: HelmRelease = serde_json::from_slice(stdout)
        .map_err(|e| ActionError::failed(op, name, format!("decoding helm output: {}", e)))?;
    Ok(h.into())
}

fn helm_timeout_secs() -> Option<u64> {
    std::env::var("KEEL_HELM_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).filter(|n| *n > 0)
}

fn push_timeout(args: &mut Vec<String>) {
    if let Some(secs) = helm_timeout_secs() {
        args.push("--timeout".into());
        args.push(format!("{}s", secs));
    }
}

/// Map helm's stderr onto the error taxonomy.
fn classify(op: Operation, release: &str, stderr: &str) -> ActionError {
    let lower = stderr.to_ascii_lowercase();
    if matches!(op, Operation::Get | Operation::Uninstall) && lower.contains("not found") {
        return ActionError::NotFound(release.to_string());
    }
    let chart_markers = ["parse error", "template:", "values don't meet the specifications", "chart requires", "unable to build kubernetes objects"];
    if chart_markers.iter().any(|m| lower.contains(m)) {
        return ActionError::Chart { op, release: release.to_string(), message: stderr.to_string() };
    }
    ActionError::failed(op, release, stderr)
}

pub struct HelmCli {
    bin: PathBuf,
    namespace: String,
    applier: Arc<dyn ManifestApplier>,
}

impl HelmCli {
    pub fn new(bin: impl Into<PathBuf>, namespace: &str, applier: Arc<dyn ManifestApplier>) -> Self {
        Self { bin: bin.into(), namespace: namespace.to_string(), applier }
    }

    async fn run(&self, op: Operation, release: &str, args: Vec<String>) -> Result<Vec<u8>, ActionError> {
        let t0 = Instant::now();
        debug!(op = %op, release = %release, ns = %self.namespace, ?args, "helm invoke");
        let out = Command::new(&self.bin)
            .args(&args)
            .arg("--namespace")
            .arg(&self.namespace)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ActionError::Unavailable(format!("spawning {}: {}", self.bin.display(), e)))?;
        histogram!("helm_call_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op.as_str());
        if out.status.success() {
            return Ok(out.stdout);
        }
        counter!("helm_call_errors_total", 1u64, "op" => op.as_str());
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        Err(classify(op, release, &stderr))
    }

    fn values_file(op: Operation, name: &str, values: &Values) -> Result<tempfile::NamedTempFile, ActionError> {
        let bytes = serde_json::to_vec(values).map_err(|e| ActionError::failed(op, name, format!("encoding values: {}", e)))?;
        let mut file = tempfile::Builder::new()
            .prefix("keel-values-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| ActionError::failed(op, name, format!("creating values file: {}", e)))?;
        file.write_all(&bytes).map_err(|e| ActionError::failed(op, name, format!("writing values file: {}", e)))?;
        Ok(file)
    }
}

#[async_trait::async_trait]
impl ActionClient for HelmCli {
    async fn get(&self, name: &str) -> Result<Release, ActionError> {
        let stdout = self.run(Operation::Get, name, vec!["status".into(), name.into(), "--output".into(), "json".into()]).await?;
        let mut rel = parse_release(Operation::Get, name, &stdout)?;
        if rel.manifest.is_empty() {
            let manifest = self.run(Operation::Get, name, vec!["get".into(), "manifest".into(), name.into()]).await?;
            rel.manifest = String::from_utf8_lossy(&manifest).into_owned();
        }
        Ok(rel)
    }

    async fn install(
        &self,
        name: &str,
        _namespace: &str,
        chart: &Chart,
        values: &Values,
        opts: ActionOptions,
    ) -> Result<Release, ActionError> {
        let file = Self::values_file(Operation::Install, name, values)?;
        let mut args = vec![
            "install".to_string(),
            name.to_string(),
            chart.path.display().to_string(),
            "--values".into(),
            file.path().display().to_string(),
            "--output".into(),
            "json".into(),
        ];
        if opts.disable_hooks { args.push("--no-hooks".into()); }
        push_timeout(&mut args);
        let stdout = self.run(Operation::Install, name, args).await?;
        parse_release(Operation::Install, name, &stdout)
    }

    async fn upgrade(
        &self,
        name: &str,
        _namespace: &str,
        chart: &Chart,
        values: &Values,
        opts: ActionOptions,
    ) -> Result<Release, ActionError> {
        let file = Self::values_file(Operation::Upgrade, name, values)?;
        // --install keeps a retried upgrade valid when the first attempt never created the release.
        let mut args = vec![
            "upgrade".to_string(),
            name.to_string(),
            chart.path.display().to_string(),
            "--install".into(),
            "--values".into(),
            file.path().display().to_string(),
            "--output".into(),
            "json".into(),
        ];
        if opts.disable_hooks { args.push("--no-hooks".into()); }
        if opts.force { args.push("--force".into()); }
        push_timeout(&mut args);
        let stdout = self.run(Operation::Upgrade, name, args).await?;
        parse_release(Operation::Upgrade, name, &stdout)
    }

    async fn uninstall(&self, name: &str, opts: ActionOptions) -> Result<UninstallResult, ActionError> {
        let mut args = vec!["uninstall".to_string(), name.to_string()];
        if opts.disable_hooks { args.push("--no-hooks".into()); }
        push_timeout(&mut args);
        let stdout = self.run(Operation::Uninstall, name, args).await?;
        Ok(UninstallResult { release: None, info: String::from_utf8_lossy(&stdout).trim().to_string() })
    }

    async fn reconcile(&self, release: &Release) -> Result<(), ActionError> {
        let t0 = Instant::now();
        let res = self
            .applier
            .apply_manifest(&release.namespace, &release.manifest)
            .await
            .map_err(|e| ActionError::failed(Operation::Reconcile, &release.name, format!("{:#}", e)));
        histogram!("helm_call_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => Operation::Reconcile.as_str());
        res
    }
}

/// Builds a [`HelmCli`] scoped to each object's namespace.
pub struct HelmCliGetter {
    bin: PathBuf,
    applier: Arc<dyn ManifestApplier>,
}

impl HelmCliGetter {
    pub fn new(bin: impl Into<PathBuf>, applier: Arc<dyn ManifestApplier>) -> Self {
        Self { bin: bin.into(), applier }
    }
}

impl ActionClientGetter for HelmCliGetter {
    fn client_for(&self, obj: &ManagedObject) -> Result<Arc<dyn ActionClient>, ActionError> {
        Ok(Arc::new(HelmCli::new(self.bin.clone(), obj.key.release_namespace(), Arc::clone(&self.applier))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_json_maps_to_release() {
        let raw = serde_json::json!({
            "name": "web",
            "namespace": "prod",
            "version": 3,
            "manifest": "---\napiVersion: v1\nkind: Service\nmetadata:\n  name: web\n",
            "config": {"replicaCount": 2},
            "info": {"status": "deployed", "description": "Upgrade complete"},
            "chart": {"metadata": {"name": "nginx", "version": "1.2.3"}}
        });
        let rel = parse_release(Operation::Get, "web", raw.to_string().as_bytes()).unwrap();
        assert_eq!(rel.revision, 3);
        assert_eq!(rel.status, ReleaseStatus::Deployed);
        assert_eq!(rel.chart_version, "1.2.3");
        assert_eq!(rel.values.get("replicaCount"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn sparse_release_json_uses_defaults() {
        let rel = parse_release(Operation::Install, "web", br#"{"name":"web","config":null}"#).unwrap();
        assert_eq!(rel.status, ReleaseStatus::Unknown);
        assert!(rel.values.is_empty());
        assert!(parse_release(Operation::Install, "web", b"not json").is_err());
    }

    #[test]
    fn stderr_classification() {
        assert!(classify(Operation::Get, "web", "Error: release: not found").is_not_found());
        assert!(classify(Operation::Uninstall, "web", "Error: uninstall: Release not loaded: web: release: not found").is_not_found());
        assert!(!classify(Operation::Install, "web", "Error: chart not found").is_not_found());
        assert!(matches!(
            classify(Operation::Install, "web", "Error: template: nginx/templates/deployment.yaml:12: bad"),
            ActionError::Chart { .. }
        ));
        assert!(matches!(classify(Operation::Upgrade, "web", "Error: context deadline exceeded"), ActionError::Failed { .. }));
    }
}
