//! Keel metrics registry.
//!
//! Collectors observe lifecycle events of the primary kind. A collector opts
//! into an event by returning `Some` from the matching capability query; the
//! compiled [`Predicate`] fans every event out to the observers that asked for
//! it and never filters anything.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use keel_core::ObjectKey;
use metrics::{counter, describe_gauge, gauge};
use tracing::trace;

pub trait CreateObserver: Send + Sync {
    fn on_create(&self, obj: &ObjectKey);
}

pub trait UpdateObserver: Send + Sync {
    fn on_update(&self, old: &ObjectKey, new: &ObjectKey);
}

pub trait DeleteObserver: Send + Sync {
    fn on_delete(&self, obj: &ObjectKey);
}

pub trait GenericObserver: Send + Sync {
    fn on_generic(&self, obj: &ObjectKey);
}

/// A registered collector. Capabilities default to absent.
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;
    fn as_create_observer(&self) -> Option<&dyn CreateObserver> { None }
    fn as_update_observer(&self) -> Option<&dyn UpdateObserver> { None }
    fn as_delete_observer(&self) -> Option<&dyn DeleteObserver> { None }
    fn as_generic_observer(&self) -> Option<&dyn GenericObserver> { None }
}

#[derive(Default, Clone)]
pub struct Registry {
    collectors: Vec<Arc<dyn Collector>>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    /// Default registry for a primary kind: a single [`InfoGauge`].
    pub fn new_info(kind: &str) -> Self {
        let mut r = Self::new();
        r.register(Arc::new(InfoGauge::new(kind)));
        r
    }

    pub fn register(&mut self, collector: Arc<dyn Collector>) { self.collectors.push(collector); }

    pub fn len(&self) -> usize { self.collectors.len() }

    pub fn is_empty(&self) -> bool { self.collectors.is_empty() }

    pub fn names(&self) -> Vec<String> { self.collectors.iter().map(|c| c.name().to_string()).collect() }

    /// Compile the event predicate. Collectors registered afterwards are not seen.
    pub fn predicate(&self) -> Predicate {
        let pick = |f: fn(&dyn Collector) -> bool| -> Vec<Arc<dyn Collector>> {
            self.collectors.iter().filter(|c| f(c.as_ref())).cloned().collect()
        };
        Predicate {
            create: pick(|c| c.as_create_observer().is_some()),
            update: pick(|c| c.as_update_observer().is_some()),
            delete: pick(|c| c.as_delete_observer().is_some()),
            generic: pick(|c| c.as_generic_observer().is_some()),
        }
    }
}

/// Event filter that records metrics as a side effect and admits everything.
#[derive(Clone)]
pub struct Predicate {
    create: Vec<Arc<dyn Collector>>,
    update: Vec<Arc<dyn Collector>>,
    delete: Vec<Arc<dyn Collector>>,
    generic: Vec<Arc<dyn Collector>>,
}

impl Predicate {
    pub fn create(&self, obj: &ObjectKey) -> bool {
        counter!("keel_primary_events_total", 1u64, "event" => "create");
        for o in self.create.iter().filter_map(|c| c.as_create_observer()) { o.on_create(obj); }
        true
    }

    pub fn update(&self, old: &ObjectKey, new: &ObjectKey) -> bool {
        counter!("keel_primary_events_total", 1u64, "event" => "update");
        for o in self.update.iter().filter_map(|c| c.as_update_observer()) { o.on_update(old, new); }
        true
    }

    pub fn delete(&self, obj: &ObjectKey) -> bool {
        counter!("keel_primary_events_total", 1u64, "event" => "delete");
        for o in self.delete.iter().filter_map(|c| c.as_delete_observer()) { o.on_delete(obj); }
        true
    }

    pub fn generic(&self, obj: &ObjectKey) -> bool {
        counter!("keel_primary_events_total", 1u64, "event" => "generic");
        for o in self.generic.iter().filter_map(|c| c.as_generic_observer()) { o.on_generic(obj); }
        true
    }
}

/// `<kind>_info{namespace,name}`: 1 while an object exists.
///
/// The exporter cannot drop a single series, so deletion sets it to 0 and
/// removes the object from [`InfoGauge::live`].
pub struct InfoGauge {
    metric: String,
    live: Mutex<BTreeSet<(String, String)>>,
}

impl InfoGauge {
    pub fn new(kind: &str) -> Self {
        let metric = info_gauge_name(kind);
        describe_gauge!(metric.clone(), format!("Information about the {} custom resource", kind));
        Self { metric, live: Mutex::new(BTreeSet::new()) }
    }

    pub fn metric_name(&self) -> &str { &self.metric }

    /// `(namespace, name)` pairs currently reported as 1.
    pub fn live(&self) -> Vec<(String, String)> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect()
    }

    fn set(&self, obj: &ObjectKey, value: f64) {
        let ns = obj.namespace.clone().unwrap_or_default();
        let name = obj.name.clone();
        trace!(metric = %self.metric, ns = %ns, name = %name, value, "info gauge");
        gauge!(self.metric.clone(), value, "namespace" => ns.clone(), "name" => name.clone());
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if value > 0.0 { live.insert((ns, name)); } else { live.remove(&(ns, name)); }
    }
}

pub fn info_gauge_name(kind: &str) -> String { format!("{}_info", kind.to_ascii_lowercase()) }

impl CreateObserver for InfoGauge {
    fn on_create(&self, obj: &ObjectKey) { self.set(obj, 1.0); }
}

impl UpdateObserver for InfoGauge {
    fn on_update(&self, _old: &ObjectKey, new: &ObjectKey) { self.set(new, 1.0); }
}

impl DeleteObserver for InfoGauge {
    fn on_delete(&self, obj: &ObjectKey) { self.set(obj, 0.0); }
}

impl Collector for InfoGauge {
    fn name(&self) -> &str { &self.metric }
    fn as_create_observer(&self) -> Option<&dyn CreateObserver> { Some(self) }
    fn as_update_observer(&self) -> Option<&dyn UpdateObserver> { Some(self) }
    fn as_delete_observer(&self) -> Option<&dyn DeleteObserver> { Some(self) }
}
