//! Recording action client for tests.
//!
//! Every call is logged and answered by a per-operation handler. Handlers
//! default to "not implemented" errors; [`FakeActionClient::in_memory`] wires
//! them to a small release store so state-machine tests can run end to end.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use keel_core::annotations::ActionOptions;
use keel_core::{Chart, ManagedObject, Release, ReleaseStatus, Values};

use crate::{ActionClient, ActionClientGetter, ActionError, Operation, UninstallResult};

#[derive(Debug, Clone, PartialEq)]
pub struct GetCall {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstallCall {
    pub name: String,
    pub namespace: String,
    pub chart: Chart,
    pub values: Values,
    pub opts: ActionOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpgradeCall {
    pub name: String,
    pub namespace: String,
    pub chart: Chart,
    pub values: Values,
    pub opts: ActionOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UninstallCall {
    pub name: String,
    pub opts: ActionOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileCall {
    pub release: Release,
}

/// Begin/end markers for every call, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Begin(Operation, String),
    End(Operation, String),
}

type Handler<C, T> = Arc<dyn Fn(&C) -> Result<T, ActionError> + Send + Sync>;

#[derive(Default)]
struct Calls {
    gets: Vec<GetCall>,
    installs: Vec<InstallCall>,
    upgrades: Vec<UpgradeCall>,
    uninstalls: Vec<UninstallCall>,
    reconciles: Vec<ReconcileCall>,
    journal: Vec<JournalEntry>,
}

struct Handlers {
    get: Handler<GetCall, Release>,
    install: Handler<InstallCall, Release>,
    upgrade: Handler<UpgradeCall, Release>,
    uninstall: Handler<UninstallCall, UninstallResult>,
    reconcile: Handler<ReconcileCall, ()>,
}

fn not_implemented<C: 'static, T: 'static>(op: Operation) -> Handler<C, T> {
    Arc::new(move |_: &C| Err(ActionError::Unavailable(format!("{} not implemented", op))))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

pub struct FakeActionClient {
    calls: Mutex<Calls>,
    handlers: Mutex<Handlers>,
    latency: Mutex<Option<Duration>>,
}

impl Default for FakeActionClient {
    fn default() -> Self { Self::new() }
}

impl FakeActionClient {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Calls::default()),
            handlers: Mutex::new(Handlers {
                get: not_implemented(Operation::Get),
                install: not_implemented(Operation::Install),
                upgrade: not_implemented(Operation::Upgrade),
                uninstall: not_implemented(Operation::Uninstall),
                reconcile: not_implemented(Operation::Reconcile),
            }),
            latency: Mutex::new(None),
        }
    }

    /// A client backed by an in-memory release store. `render` produces the
    /// manifest for a given set of values.
    pub fn in_memory(render: impl Fn(&Values) -> String + Send + Sync + 'static) -> (Self, Arc<MemoryReleases>) {
        let store = Arc::new(MemoryReleases::default());
        let render: Arc<dyn Fn(&Values) -> String + Send + Sync> = Arc::new(render);
        let fake = Self::new();

        let s = Arc::clone(&store);
        fake.handle_get(move |c| s.get(&c.name).ok_or_else(|| ActionError::NotFound(c.name.clone())));

        let (s, r) = (Arc::clone(&store), Arc::clone(&render));
        fake.handle_install(move |c| {
            if s.get(&c.name).is_some() {
                return Err(ActionError::failed(Operation::Install, &c.name, "cannot re-use a name that is still in use"));
            }
            let rel = Release {
                name: c.name.clone(),
                namespace: c.namespace.clone(),
                chart_name: c.chart.name.clone(),
                chart_version: c.chart.version.clone(),
                values: c.values.clone(),
                manifest: r(&c.values),
                revision: 1,
                status: ReleaseStatus::Deployed,
            };
            s.put(rel.clone());
            Ok(rel)
        });

        let (s, r) = (Arc::clone(&store), Arc::clone(&render));
        fake.handle_upgrade(move |c| {
            let prev = s
                .get(&c.name)
                .ok_or_else(|| ActionError::failed(Operation::Upgrade, &c.name, "has no deployed releases"))?;
            let rel = Release {
                chart_name: c.chart.name.clone(),
                chart_version: c.chart.version.clone(),
                values: c.values.clone(),
                manifest: r(&c.values),
                revision: prev.revision + 1,
                status: ReleaseStatus::Deployed,
                ..prev
            };
            s.put(rel.clone());
            Ok(rel)
        });

        let s = Arc::clone(&store);
        fake.handle_uninstall(move |c| match s.remove(&c.name) {
            Some(rel) => Ok(UninstallResult { release: Some(rel), info: "uninstalled".into() }),
            None => Err(ActionError::NotFound(c.name.clone())),
        });

        fake.handle_reconcile(|_| Ok(()));
        (fake, store)
    }

    /// Sleep inside every call, between its begin and end journal entries.
    pub fn with_latency(self, latency: Duration) -> Self {
        *lock(&self.latency) = Some(latency);
        self
    }

    pub fn handle_get(&self, f: impl Fn(&GetCall) -> Result<Release, ActionError> + Send + Sync + 'static) {
        lock(&self.handlers).get = Arc::new(f);
    }

    pub fn handle_install(&self, f: impl Fn(&InstallCall) -> Result<Release, ActionError> + Send + Sync + 'static) {
        lock(&self.handlers).install = Arc::new(f);
    }

    pub fn handle_upgrade(&self, f: impl Fn(&UpgradeCall) -> Result<Release, ActionError> + Send + Sync + 'static) {
        lock(&self.handlers).upgrade = Arc::new(f);
    }

    pub fn handle_uninstall(
        &self,
        f: impl Fn(&UninstallCall) -> Result<UninstallResult, ActionError> + Send + Sync + 'static,
    ) {
        lock(&self.handlers).uninstall = Arc::new(f);
    }

    pub fn handle_reconcile(&self, f: impl Fn(&ReconcileCall) -> Result<(), ActionError> + Send + Sync + 'static) {
        lock(&self.handlers).reconcile = Arc::new(f);
    }

    pub fn gets(&self) -> Vec<GetCall> { lock(&self.calls).gets.clone() }
    pub fn installs(&self) -> Vec<InstallCall> { lock(&self.calls).installs.clone() }
    pub fn upgrades(&self) -> Vec<UpgradeCall> { lock(&self.calls).upgrades.clone() }
    pub fn uninstalls(&self) -> Vec<UninstallCall> { lock(&self.calls).uninstalls.clone() }
    pub fn reconciles(&self) -> Vec<ReconcileCall> { lock(&self.calls).reconciles.clone() }
    pub fn journal(&self) -> Vec<JournalEntry> { lock(&self.calls).journal.clone() }

    async fn enter(&self, op: Operation, name: &str) {
        lock(&self.calls).journal.push(JournalEntry::Begin(op, name.to_string()));
        let latency = *lock(&self.latency);
        if let Some(d) = latency { tokio::time::sleep(d).await; }
    }

    fn exit(&self, op: Operation, name: &str) {
        lock(&self.calls).journal.push(JournalEntry::End(op, name.to_string()));
    }
}

#[async_trait::async_trait]
impl ActionClient for FakeActionClient {
    async fn get(&self, name: &str) -> Result<Release, ActionError> {
        let call = GetCall { name: name.to_string() };
        self.enter(Operation::Get, name).await;
        lock(&self.calls).gets.push(call.clone());
        let h = Arc::clone(&lock(&self.handlers).get);
        let res = h(&call);
        self.exit(Operation::Get, name);
        res
    }

    async fn install(
        &self,
        name: &str,
        namespace: &str,
        chart: &Chart,
        values: &Values,
        opts: ActionOptions,
    ) -> Result<Release, ActionError> {
        let call = InstallCall {
            name: name.to_string(),
            namespace: namespace.to_string(),
            chart: chart.clone(),
            values: values.clone(),
            opts,
        };
        self.enter(Operation::Install, name).await;
        lock(&self.calls).installs.push(call.clone());
        let h = Arc::clone(&lock(&self.handlers).install);
        let res = h(&call);
        self.exit(Operation::Install, name);
        res
    }

    async fn upgrade(
        &self,
        name: &str,
        namespace: &str,
        chart: &Chart,
        values: &Values,
        opts: ActionOptions,
    ) -> Result<Release, ActionError> {
        let call = UpgradeCall {
            name: name.to_string(),
            namespace: namespace.to_string(),
            chart: chart.clone(),
            values: values.clone(),
            opts,
        };
        self.enter(Operation::Upgrade, name).await;
        lock(&self.calls).upgrades.push(call.clone());
        let h = Arc::clone(&lock(&self.handlers).upgrade);
        let res = h(&call);
        self.exit(Operation::Upgrade, name);
        res
    }

    async fn uninstall(&self, name: &str, opts: ActionOptions) -> Result<UninstallResult, ActionError> {
        let call = UninstallCall { name: name.to_string(), opts };
        self.enter(Operation::Uninstall, name).await;
        lock(&self.calls).uninstalls.push(call.clone());
        let h = Arc::clone(&lock(&self.handlers).uninstall);
        let res = h(&call);
        self.exit(Operation::Uninstall, name);
        res
    }

    async fn reconcile(&self, release: &Release) -> Result<(), ActionError> {
        let call = ReconcileCall { release: release.clone() };
        self.enter(Operation::Reconcile, &release.name).await;
        lock(&self.calls).reconciles.push(call.clone());
        let h = Arc::clone(&lock(&self.handlers).reconcile);
        let res = h(&call);
        self.exit(Operation::Reconcile, &release.name);
        res
    }
}

/// Release store behind [`FakeActionClient::in_memory`].
#[derive(Debug, Default)]
pub struct MemoryReleases {
    releases: Mutex<BTreeMap<String, Release>>,
}

impl MemoryReleases {
    pub fn get(&self, name: &str) -> Option<Release> { lock(&self.releases).get(name).cloned() }
    pub fn put(&self, rel: Release) { lock(&self.releases).insert(rel.name.clone(), rel); }
    pub fn remove(&self, name: &str) -> Option<Release> { lock(&self.releases).remove(name) }
    pub fn len(&self) -> usize { lock(&self.releases).len() }
    pub fn is_empty(&self) -> bool { lock(&self.releases).is_empty() }
}

/// Getter returning the same client for every object, or a fixed error.
pub struct FakeActionClientGetter {
    client: Arc<dyn ActionClient>,
    error: Option<String>,
}

impl FakeActionClientGetter {
    pub fn new(client: Arc<dyn ActionClient>) -> Self { Self { client, error: None } }

    pub fn failing(client: Arc<dyn ActionClient>, error: &str) -> Self {
        Self { client, error: Some(error.to_string()) }
    }
}

impl ActionClientGetter for FakeActionClientGetter {
    fn client_for(&self, _obj: &ManagedObject) -> Result<Arc<dyn ActionClient>, ActionError> {
        match &self.error {
            Some(e) => Err(ActionError::Unavailable(e.clone())),
            None => Ok(Arc::clone(&self.client)),
        }
    }
}
