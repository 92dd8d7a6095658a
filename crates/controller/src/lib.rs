//! Keel controller runner.
//!
//! A single loop owns the work queue. Keys arrive on a channel, are queued at
//! most once, and run on spawned tasks up to the concurrency ceiling. A key
//! triggered while it is running is marked dirty and queued again when the
//! running invocation finishes, so one key never reconciles concurrently with
//! itself. Delayed requeues live in a single timer queue holding at most one
//! deadline per key; a key that runs drops its pending deadline.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use keel_core::ObjectKey;
use keel_reconciler::{Outcome, ReconcileError, Reconciler};
use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::{self, DelayQueue};
use tracing::{debug, error, info};

/// The work a controller drives for each key.
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Outcome, ReconcileError>;
}

#[async_trait::async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Outcome, ReconcileError> {
        Reconciler::reconcile(self, key, cancel).await
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_concurrent: usize,
    /// Per-invocation deadline; expiry cancels the invocation's token.
    pub timeout: Option<Duration>,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub queue_cap: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            timeout: None,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_secs(1000),
            queue_cap: 2048,
        }
    }
}

impl RunnerConfig {
    /// Defaults with `KEEL_QUEUE_CAP` and `KEEL_RECONCILE_TIMEOUT_SECS` applied.
    pub fn from_env(max_concurrent: usize) -> Self {
        let queue_cap = std::env::var("KEEL_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048);
        let timeout = std::env::var("KEEL_RECONCILE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|n| *n > 0)
            .map(Duration::from_secs);
        Self { max_concurrent: max_concurrent.max(1), timeout, queue_cap: queue_cap.max(1), ..Self::default() }
    }
}

/// Per-key exponential backoff: `base * 2^(failures-1)`, capped at `max`.
pub fn backoff(failures: u32, base: Duration, max: Duration) -> Duration {
    let exp = failures.saturating_sub(1).min(32);
    base.saturating_mul(2u32.saturating_pow(exp)).min(max)
}

/// Cloneable handle for feeding keys into a controller.
#[derive(Clone)]
pub struct Trigger {
    tx: mpsc::Sender<ObjectKey>,
}

impl Trigger {
    /// Returns false once the controller has stopped.
    pub async fn send(&self, key: ObjectKey) -> bool { self.tx.send(key).await.is_ok() }

    /// Non-blocking variant for synchronous callers; drops the key when the queue is full.
    pub fn try_send(&self, key: ObjectKey) -> bool { self.tx.try_send(key).is_ok() }
}

enum Finished {
    Ok(Outcome),
    Err(ReconcileError),
    Panicked,
}

/// Delayed requeues, one deadline per key.
#[derive(Default)]
struct Timers {
    queue: DelayQueue<ObjectKey>,
    keys: FxHashMap<ObjectKey, delay_queue::Key>,
}

impl Timers {
    /// Replaces any deadline already pending for `key`.
    fn schedule(&mut self, key: ObjectKey, delay: Duration) {
        match self.keys.get(&key) {
            Some(k) => self.queue.reset(k, delay),
            None => {
                let k = self.queue.insert(key.clone(), delay);
                self.keys.insert(key, k);
            }
        }
    }

    fn cancel(&mut self, key: &ObjectKey) {
        if let Some(k) = self.keys.remove(key) {
            self.queue.remove(&k);
        }
    }

    fn expired(&mut self, e: delay_queue::Expired<ObjectKey>) -> ObjectKey {
        let key = e.into_inner();
        self.keys.remove(&key);
        key
    }

    fn len(&self) -> usize { self.keys.len() }

    fn is_empty(&self) -> bool { self.keys.is_empty() }
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<ObjectKey>,
    queued: FxHashSet<ObjectKey>,
    active: FxHashSet<ObjectKey>,
    dirty: FxHashSet<ObjectKey>,
    failures: FxHashMap<ObjectKey, u32>,
    timers: Timers,
}

impl Queue {
    fn push(&mut self, key: ObjectKey) {
        if self.active.contains(&key) {
            self.dirty.insert(key);
        } else if self.queued.insert(key.clone()) {
            self.pending.push_back(key);
        }
    }

    fn pop(&mut self) -> Option<ObjectKey> {
        let key = self.pending.pop_front()?;
        self.queued.remove(&key);
        self.timers.cancel(&key);
        self.active.insert(key.clone());
        Some(key)
    }
}

pub struct Controller<R: Reconcile> {
    name: String,
    reconciler: Arc<R>,
    cfg: RunnerConfig,
    tx: mpsc::Sender<ObjectKey>,
    rx: mpsc::Receiver<ObjectKey>,
}

impl<R: Reconcile> Controller<R> {
    pub fn new(name: &str, reconciler: Arc<R>, cfg: RunnerConfig) -> Self {
        let (tx, rx) = mpsc::channel(cfg.queue_cap.max(1));
        Self { name: name.to_string(), reconciler, cfg, tx, rx }
    }

    /// Like [`Controller::new`] for reconcilers that need to trigger their own
    /// controller, e.g. through dependent watches.
    pub fn new_with(name: &str, cfg: RunnerConfig, build: impl FnOnce(Trigger) -> Arc<R>) -> Self {
        let (tx, rx) = mpsc::channel(cfg.queue_cap.max(1));
        let reconciler = build(Trigger { tx: tx.clone() });
        Self { name: name.to_string(), reconciler, cfg, tx, rx }
    }

    pub fn trigger(&self) -> Trigger { Trigger { tx: self.tx.clone() } }

    /// Run until `cancel` fires, then wait for in-flight invocations to observe it.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut q = Queue::default();
        let mut in_flight: JoinSet<(ObjectKey, Finished)> = JoinSet::new();
        info!(controller = %self.name, max_concurrent = self.cfg.max_concurrent, "controller started");
        loop {
            while in_flight.len() < self.cfg.max_concurrent {
                let Some(key) = q.pop() else { break };
                self.spawn(&mut in_flight, key, &cancel);
            }
            gauge!("keel_queue_depth", q.pending.len() as f64, "controller" => self.name.clone());
            gauge!("keel_active_reconciles", in_flight.len() as f64, "controller" => self.name.clone());
            gauge!("keel_scheduled_requeues", q.timers.len() as f64, "controller" => self.name.clone());

            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(key) = self.rx.recv() => q.push(key),
                Some(expired) = std::future::poll_fn(|cx| q.timers.queue.poll_expired(cx)), if !q.timers.is_empty() => {
                    let key = q.timers.expired(expired);
                    q.push(key);
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => match joined {
                    Ok((key, finished)) => self.finish(&mut q, key, finished),
                    Err(e) => error!(controller = %self.name, error = %e, "reconcile task failed to join"),
                },
            }
        }
        debug!(controller = %self.name, in_flight = in_flight.len(), "draining");
        while in_flight.join_next().await.is_some() {}
        info!(controller = %self.name, "controller stopped");
    }

    fn spawn(&self, set: &mut JoinSet<(ObjectKey, Finished)>, key: ObjectKey, cancel: &CancellationToken) {
        let reconciler = Arc::clone(&self.reconciler);
        let child = cancel.child_token();
        let timeout = self.cfg.timeout;
        let name = self.name.clone();
        set.spawn(async move {
            let t0 = Instant::now();
            let deadline = timeout.map(|t| {
                let c = child.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(t).await;
                    c.cancel();
                })
            });
            let res = AssertUnwindSafe(reconciler.reconcile(&key, &child)).catch_unwind().await;
            if let Some(h) = deadline { h.abort(); }
            histogram!("keel_controller_invocation_ms", t0.elapsed().as_secs_f64() * 1000.0, "controller" => name);
            let finished = match res {
                Ok(Ok(outcome)) => Finished::Ok(outcome),
                Ok(Err(e)) => Finished::Err(e),
                Err(_) => Finished::Panicked,
            };
            (key, finished)
        });
    }

    fn finish(&self, q: &mut Queue, key: ObjectKey, finished: Finished) {
        q.active.remove(&key);
        let panicked = matches!(finished, Finished::Panicked);
        match finished {
            Finished::Ok(Outcome::Done) => {
                q.failures.remove(&key);
            }
            Finished::Ok(Outcome::RequeueAfter(d)) => {
                q.failures.remove(&key);
                counter!("keel_requeues_total", 1u64, "reason" => "period");
                q.timers.schedule(key.clone(), d);
            }
            Finished::Err(e) if e.is_conflict() => {
                counter!("keel_requeues_total", 1u64, "reason" => "conflict");
                debug!(controller = %self.name, object = %key, "conflict, requeue now");
                q.push(key.clone());
            }
            Finished::Err(_) | Finished::Panicked => {
                let n = q.failures.entry(key.clone()).or_insert(0);
                *n = n.saturating_add(1);
                let delay = backoff(*n, self.cfg.base_backoff, self.cfg.max_backoff);
                counter!("keel_requeues_total", 1u64, "reason" => "backoff");
                if panicked {
                    error!(controller = %self.name, object = %key, "reconcile panicked");
                }
                debug!(controller = %self.name, object = %key, failures = *n, delay_ms = delay.as_millis() as u64, "backing off");
                q.timers.schedule(key.clone(), delay);
            }
        }
        if q.dirty.remove(&key) {
            q.push(key);
        }
    }
}
