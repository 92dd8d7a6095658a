use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use keel_action::{ActionClient, ActionClientGetter, Operation};
use keel_core::annotations::ActionOptions;
use keel_core::values::{ResolvedValues, ValuesResolver};
use keel_core::watches::WatchDescriptor;
use keel_core::{Chart, ManagedObject, ObjectKey, ObjectStatus, Release, ReleaseStatus, UNINSTALL_FINALIZER};
use keel_store::{DependentWatches, ReleaseGuard, ReleaseLocks, WatchRegistrar};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ObjectClient;
use crate::provenance::{self, OUTCOME_FAILED, OUTCOME_SUCCEEDED};
use crate::{Outcome, ReconcileError};

const DELETION_POLL: Duration = Duration::from_millis(10);

/// What an object needs, recomputed on every invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Marked for deletion with the finalizer already gone: only local state to drop.
    Deleting,
    NeedsInstall,
    NeedsUpgrade,
    /// Marked for deletion and the release is the only thing holding it.
    NeedsUninstallOnly,
    UpToDate,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Deleting => "deleting",
            State::NeedsInstall => "needs_install",
            State::NeedsUpgrade => "needs_upgrade",
            State::NeedsUninstallOnly => "needs_uninstall_only",
            State::UpToDate => "up_to_date",
        }
    }

    fn for_deletion(obj: &ManagedObject) -> Self {
        if obj.has_finalizer(UNINSTALL_FINALIZER) { State::NeedsUninstallOnly } else { State::Deleting }
    }
}

/// Decide the action for an object that is not being deleted.
///
/// A missing release needs installing. A release needs upgrading when the
/// recorded values fingerprint or chart version no longer match, or when its
/// last operation left it failed or uninstalled.
pub fn decide(obj: &ManagedObject, release: Option<&Release>, fingerprint: &str, chart: &Chart) -> State {
    let Some(rel) = release else { return State::NeedsInstall };
    if matches!(rel.status, ReleaseStatus::Failed | ReleaseStatus::Uninstalled) {
        return State::NeedsUpgrade;
    }
    if provenance::stored_fingerprint(obj) != Some(fingerprint) || rel.chart_version != chart.version {
        return State::NeedsUpgrade;
    }
    State::UpToDate
}

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, ReconcileError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReconcileError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Reconciler for one watched kind.
pub struct Reconciler {
    descriptor: Arc<WatchDescriptor>,
    objects: Arc<dyn ObjectClient>,
    actions: Arc<dyn ActionClientGetter>,
    values: ValuesResolver,
    locks: Arc<ReleaseLocks>,
    dependents: Option<Arc<DependentWatches>>,
}

impl Reconciler {
    /// `locks` is shared by every reconciler in the process: objects of
    /// different kinds with the same namespace and name map to one release.
    pub fn new(
        descriptor: WatchDescriptor,
        objects: Arc<dyn ObjectClient>,
        actions: Arc<dyn ActionClientGetter>,
        registrar: Arc<dyn WatchRegistrar>,
        locks: Arc<ReleaseLocks>,
    ) -> Self {
        let dependents = descriptor
            .watch_dependent_resources
            .then(|| Arc::new(DependentWatches::new(descriptor.gvk.clone(), registrar)));
        let values = ValuesResolver::new(descriptor.override_values.clone());
        Self { descriptor: Arc::new(descriptor), objects, actions, values, locks, dependents }
    }

    pub fn descriptor(&self) -> &WatchDescriptor { &self.descriptor }

    pub fn locks(&self) -> &Arc<ReleaseLocks> { &self.locks }

    pub fn dependents(&self) -> Option<&Arc<DependentWatches>> { self.dependents.as_ref() }

    pub async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Outcome, ReconcileError> {
        let t0 = Instant::now();
        let kind = self.descriptor.gvk.kind.clone();
        let res = self.run(key, cancel).await;
        histogram!("keel_reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind.clone());
        match &res {
            Ok(outcome) => debug!(object = %key, ?outcome, "reconciled"),
            Err(e) => {
                counter!("keel_reconcile_errors_total", 1u64, "kind" => kind, "class" => e.class().as_str());
                warn!(object = %key, class = e.class().as_str(), error = %e, "reconcile failed");
            }
        }
        res
    }

    async fn run(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Outcome, ReconcileError> {
        let mut obj = match self.objects.get(key).await {
            Ok(o) => o,
            Err(e) if e.is_not_found() => {
                if let Some(dw) = &self.dependents { dw.forget(key); }
                debug!(object = %key, "object gone");
                return Ok(Outcome::Done);
            }
            Err(source) => return Err(ReconcileError::Fetch { key: key.to_string(), source }),
        };
        if obj.is_deleting() {
            return self.finalize(obj, cancel).await;
        }
        let client = self.actions.client_for(&obj).map_err(ReconcileError::Client)?;

        if obj.add_finalizer(UNINSTALL_FINALIZER) {
            obj = self.write(&obj).await?;
            debug!(object = %key, "finalizer added");
        }

        let resolved = match self.values.resolve(&obj) {
            Ok(r) => r,
            Err(e) => {
                let mut status = obj.status.clone();
                provenance::mark_irreconcilable(&mut status, e.to_string());
                self.write_status_best_effort(&obj, status).await;
                return Err(e.into());
            }
        };

        let guard = self.acquire(key, cancel).await?;
        let current = match cancellable(cancel, client.get(key.release_name())).await? {
            Ok(rel) => Some(rel),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(ReconcileError::Action(e)),
        };
        let state = decide(&obj, current.as_ref(), &resolved.fingerprint, &self.descriptor.chart);
        debug!(object = %key, state = state.as_str(), fingerprint = %resolved.fingerprint, "release state");

        let (action, release) = match (state, current) {
            (State::UpToDate, Some(rel)) => {
                self.correct_drift(client.as_ref(), &obj, &rel, cancel).await?;
                (Operation::Reconcile, rel)
            }
            (State::NeedsUpgrade, Some(_)) => {
                (Operation::Upgrade, self.deploy(Operation::Upgrade, client.as_ref(), &obj, &resolved, cancel).await?)
            }
            _ => (Operation::Install, self.deploy(Operation::Install, client.as_ref(), &obj, &resolved, cancel).await?),
        };

        let mut status = obj.status.clone();
        provenance::mark_deployed(&mut status, action, &release);
        if action != Operation::Reconcile {
            provenance::record(&mut obj, action, &resolved.fingerprint, &release, Utc::now());
            obj = self.write(&obj).await?;
        }
        if !provenance::same_status(&obj.status, &status) {
            obj.status = status;
            self.objects
                .update_status(&obj)
                .await
                .map_err(|source| ReconcileError::Write { key: key.to_string(), source })?;
        }
        if let Some(dw) = &self.dependents {
            dw.sync(key, &release.manifest).await?;
        }
        provenance::count_action(action, OUTCOME_SUCCEEDED);
        self.locks.release(guard);
        Ok(Outcome::after(self.descriptor.reconcile_period))
    }

    async fn deploy(
        &self,
        op: Operation,
        client: &dyn ActionClient,
        obj: &ManagedObject,
        resolved: &ResolvedValues,
        cancel: &CancellationToken,
    ) -> Result<Release, ReconcileError> {
        let (name, ns) = (obj.key.release_name(), obj.key.release_namespace());
        let chart = &self.descriptor.chart;
        let res = if op == Operation::Upgrade {
            let opts = ActionOptions::from_annotations(&self.descriptor.annotations.upgrade, obj);
            cancellable(cancel, client.upgrade(name, ns, chart, &resolved.values, opts)).await?
        } else {
            let opts = ActionOptions::from_annotations(&self.descriptor.annotations.install, obj);
            cancellable(cancel, client.install(name, ns, chart, &resolved.values, opts)).await?
        };
        match res {
            Ok(rel) => {
                info!(object = %obj.key, action = op.as_str(), release = %rel.name, revision = rel.revision, "release deployed");
                Ok(rel)
            }
            Err(e) => {
                provenance::count_action(op, OUTCOME_FAILED);
                let mut status = obj.status.clone();
                provenance::mark_failed(&mut status, op, e.to_string());
                self.write_status_best_effort(obj, status).await;
                Err(ReconcileError::Action(e))
            }
        }
    }

    async fn correct_drift(
        &self,
        client: &dyn ActionClient,
        obj: &ManagedObject,
        release: &Release,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileError> {
        if let Err(e) = cancellable(cancel, client.reconcile(release)).await? {
            provenance::count_action(Operation::Reconcile, OUTCOME_FAILED);
            let mut status = obj.status.clone();
            provenance::mark_failed(&mut status, Operation::Reconcile, e.to_string());
            self.write_status_best_effort(obj, status).await;
            return Err(ReconcileError::Action(e));
        }
        Ok(())
    }

    async fn finalize(&self, mut obj: ManagedObject, cancel: &CancellationToken) -> Result<Outcome, ReconcileError> {
        let key = obj.key.clone();
        let state = State::for_deletion(&obj);
        debug!(object = %key, state = state.as_str(), "object marked for deletion");
        if state == State::Deleting {
            if let Some(dw) = &self.dependents { dw.forget(&key); }
            return Ok(Outcome::Done);
        }

        let client = self.actions.client_for(&obj).map_err(ReconcileError::Client)?;
        let name = key.release_name().to_string();
        let guard = self.acquire(&key, cancel).await?;
        let opts = ActionOptions::from_annotations(&self.descriptor.annotations.uninstall, &obj);
        match cancellable(cancel, client.uninstall(&name, opts)).await? {
            Ok(res) => info!(object = %key, release = %name, info = %res.info, "release uninstalled"),
            Err(e) if e.is_not_found() => debug!(object = %key, release = %name, "release already absent"),
            Err(source) => {
                provenance::count_action(Operation::Uninstall, OUTCOME_FAILED);
                return Err(ReconcileError::Uninstall { release: name, source });
            }
        }

        obj.remove_finalizer(UNINSTALL_FINALIZER);
        match self.objects.update(&obj).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(source) => return Err(ReconcileError::Write { key: key.to_string(), source }),
        }
        if let Some(dw) = &self.dependents { dw.forget(&key); }
        provenance::count_action(Operation::Uninstall, OUTCOME_SUCCEEDED);
        self.locks.release(guard);

        self.wait_for_deletion(&key, obj.uid.as_deref(), cancel).await?;
        Ok(Outcome::Done)
    }

    /// Poll until the object is gone, replaced, or held only by other finalizers.
    async fn wait_for_deletion(&self, key: &ObjectKey, uid: Option<&str>, cancel: &CancellationToken) -> Result<(), ReconcileError> {
        loop {
            match self.objects.get(key).await {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(source) => return Err(ReconcileError::Fetch { key: key.to_string(), source }),
                Ok(o) if o.uid.as_deref() != uid => return Ok(()),
                Ok(o) if !o.has_finalizer(UNINSTALL_FINALIZER) && !o.finalizers.is_empty() => return Ok(()),
                Ok(_) => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ReconcileError::Cancelled),
                _ = tokio::time::sleep(DELETION_POLL) => {}
            }
        }
    }

    async fn acquire(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<ReleaseGuard, ReconcileError> {
        Ok(cancellable(cancel, self.locks.acquire(&key.release_key())).await??)
    }

    async fn write(&self, obj: &ManagedObject) -> Result<ManagedObject, ReconcileError> {
        self.objects.update(obj).await.map_err(|source| ReconcileError::Write { key: obj.key.to_string(), source })
    }

    /// Status writes on failure paths never mask the original error.
    async fn write_status_best_effort(&self, obj: &ManagedObject, status: ObjectStatus) {
        if provenance::same_status(&obj.status, &status) { return; }
        let mut o = obj.clone();
        o.status = status;
        if let Err(e) = self.objects.update_status(&o).await {
            warn!(object = %obj.key, error = %e, "status write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::annotations::{CHART_VERSION, VALUES_FINGERPRINT};
    use keel_core::Gvk;
    use std::path::PathBuf;

    fn chart(v: &str) -> Chart { Chart { name: "nginx".into(), version: v.into(), path: PathBuf::from("charts/nginx") } }

    fn obj(fp: Option<&str>) -> ManagedObject {
        let mut o = ManagedObject::new(ObjectKey::new(Gvk::new("x.io", "v1", "App"), Some("prod"), "web"), serde_json::json!({}));
        if let Some(fp) = fp {
            o.annotations.insert(VALUES_FINGERPRINT.into(), fp.into());
            o.annotations.insert(CHART_VERSION.into(), "1.0.0".into());
        }
        o
    }

    fn release(status: ReleaseStatus, version: &str) -> Release {
        Release {
            name: "web".into(),
            namespace: "prod".into(),
            chart_name: "nginx".into(),
            chart_version: version.into(),
            values: Default::default(),
            manifest: String::new(),
            revision: 1,
            status,
        }
    }

    #[test]
    fn decide_table() {
        let c = chart("1.0.0");
        let deployed = release(ReleaseStatus::Deployed, "1.0.0");
        assert_eq!(decide(&obj(None), None, "f1", &c), State::NeedsInstall);
        assert_eq!(decide(&obj(Some("f1")), Some(&deployed), "f1", &c), State::UpToDate);
        assert_eq!(decide(&obj(Some("f1")), Some(&deployed), "f2", &c), State::NeedsUpgrade);
        assert_eq!(decide(&obj(None), Some(&deployed), "f1", &c), State::NeedsUpgrade);
        assert_eq!(decide(&obj(Some("f1")), Some(&deployed), "f1", &chart("2.0.0")), State::NeedsUpgrade);
        let failed = release(ReleaseStatus::Failed, "1.0.0");
        assert_eq!(decide(&obj(Some("f1")), Some(&failed), "f1", &c), State::NeedsUpgrade);
    }

    #[test]
    fn deletion_states() {
        let mut o = obj(None);
        assert_eq!(State::for_deletion(&o), State::Deleting);
        o.add_finalizer(UNINSTALL_FINALIZER);
        assert_eq!(State::for_deletion(&o), State::NeedsUninstallOnly);
    }

    #[tokio::test]
    async fn cancelled_token_wins() {
        let t = CancellationToken::new();
        t.cancel();
        let r = cancellable(&t, std::future::pending::<()>()).await;
        assert!(matches!(r, Err(ReconcileError::Cancelled)));
    }
}
