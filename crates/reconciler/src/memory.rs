//! In-memory [`ObjectClient`] with API-server-like write semantics.
//!
//! Resource versions are checked on every write, status writes leave metadata
//! alone, and an object marked for deletion disappears once its last finalizer
//! is removed.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use keel_core::{ManagedObject, ObjectKey};

use crate::client::{ObjectClient, ObjectError};

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, ManagedObject>,
    next_rv: u64,
    next_uid: u64,
    updates: usize,
    status_updates: usize,
    inject_update: Vec<ObjectError>,
    inject_status: Vec<ObjectError>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

#[derive(Default)]
pub struct MemoryObjectClient {
    state: Mutex<State>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

fn check_rv(stored: &ManagedObject, incoming: &ManagedObject) -> Result<(), ObjectError> {
    match &incoming.resource_version {
        Some(rv) if Some(rv) != stored.resource_version.as_ref() => Err(ObjectError::Conflict(incoming.key.to_string())),
        _ => Ok(()),
    }
}

impl MemoryObjectClient {
    pub fn new() -> Self { Self::default() }

    /// Create or replace an object, assigning uid and resource version.
    pub fn insert(&self, mut obj: ManagedObject) -> ManagedObject {
        let mut st = lock(&self.state);
        if obj.uid.is_none() {
            st.next_uid += 1;
            obj.uid = Some(format!("uid-{}", st.next_uid));
        }
        obj.resource_version = Some(st.bump());
        st.objects.insert(obj.key.clone(), obj.clone());
        obj
    }

    /// Read without counting as a client call.
    pub fn peek(&self, key: &ObjectKey) -> Option<ManagedObject> { lock(&self.state).objects.get(key).cloned() }

    /// Replace the spec, as a user edit would.
    pub fn set_spec(&self, key: &ObjectKey, spec: serde_json::Value) -> bool {
        let mut st = lock(&self.state);
        let rv = st.bump();
        match st.objects.get_mut(key) {
            Some(o) => {
                o.spec = spec;
                o.generation = Some(o.generation.unwrap_or(1) + 1);
                o.resource_version = Some(rv);
                true
            }
            None => false,
        }
    }

    /// Request deletion. Objects without finalizers go away immediately.
    pub fn delete(&self, key: &ObjectKey) -> bool {
        let mut st = lock(&self.state);
        let rv = st.bump();
        let Some(o) = st.objects.get_mut(key) else { return false };
        if o.finalizers.is_empty() {
            st.objects.remove(key);
            return true;
        }
        if o.deletion_timestamp.is_none() { o.deletion_timestamp = Some(Utc::now()); }
        o.resource_version = Some(rv);
        true
    }

    /// Fail the next metadata write with `err`.
    pub fn fail_next_update(&self, err: ObjectError) { lock(&self.state).inject_update.push(err); }

    /// Fail the next status write with `err`.
    pub fn fail_next_status_update(&self, err: ObjectError) { lock(&self.state).inject_status.push(err); }

    pub fn update_count(&self) -> usize { lock(&self.state).updates }

    pub fn status_update_count(&self) -> usize { lock(&self.state).status_updates }
}

#[async_trait::async_trait]
impl ObjectClient for MemoryObjectClient {
    async fn get(&self, key: &ObjectKey) -> Result<ManagedObject, ObjectError> {
        lock(&self.state).objects.get(key).cloned().ok_or_else(|| ObjectError::NotFound(key.to_string()))
    }

    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject, ObjectError> {
        let mut st = lock(&self.state);
        if !st.inject_update.is_empty() { return Err(st.inject_update.remove(0)); }
        let rv = st.bump();
        let stored = st.objects.get_mut(&obj.key).ok_or_else(|| ObjectError::NotFound(obj.key.to_string()))?;
        check_rv(stored, obj)?;
        stored.finalizers = obj.finalizers.clone();
        stored.labels = obj.labels.clone();
        stored.annotations = obj.annotations.clone();
        stored.resource_version = Some(rv);
        let out = stored.clone();
        st.updates += 1;
        if out.is_deleting() && out.finalizers.is_empty() {
            st.objects.remove(&obj.key);
        }
        Ok(out)
    }

    async fn update_status(&self, obj: &ManagedObject) -> Result<ManagedObject, ObjectError> {
        let mut st = lock(&self.state);
        if !st.inject_status.is_empty() { return Err(st.inject_status.remove(0)); }
        let rv = st.bump();
        let stored = st.objects.get_mut(&obj.key).ok_or_else(|| ObjectError::NotFound(obj.key.to_string()))?;
        check_rv(stored, obj)?;
        stored.status = obj.status.clone();
        stored.resource_version = Some(rv);
        let out = stored.clone();
        st.status_updates += 1;
        Ok(out)
    }
}
