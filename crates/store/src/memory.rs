//! In-RAM object store and event recorder.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use registry_core::{EventKind, EventSink, ObjectKey, ObjectKind};
use tracing::trace;

use crate::{merge_patch, ObjectStore, Selector, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
    pub status_patches: u64,
}

impl WriteCounts {
    pub fn writes(&self) -> u64 {
        self.creates + self.updates + self.deletes + self.status_patches
    }
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    resource_version: u64,
    conflicts: BTreeMap<ObjectKey, u32>,
    failing_writes: BTreeMap<ObjectKey, String>,
    failing_deletes: BTreeMap<ObjectKey, String>,
    counts: WriteCounts,
}

impl Inner {
    fn next_rv(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn admit(&mut self, mut obj: DynamicObject) -> DynamicObject {
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        if obj.metadata.creation_timestamp.is_none() {
            obj.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        }
        obj.metadata.resource_version = Some(self.next_rv());
        obj
    }
}

/// Object store kept in a map keyed by [`ObjectKey`].
///
/// Emulates the parts of the API server the operator relies on: resource
/// versions with optimistic concurrency, UID assignment, UID-guarded deletes
/// and a status subresource (updates never touch `status`). Conflicts and
/// failures can be injected per object.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed an object without counting it as a write. Returns the stored copy.
    pub fn insert(&self, obj: DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::of(&obj)?;
        let mut inner = self.lock();
        let stored = inner.admit(obj);
        inner.objects.insert(key, stored.clone());
        Ok(stored)
    }

    /// The next `n` updates of `key` fail with a conflict.
    pub fn inject_conflicts(&self, key: &ObjectKey, n: u32) {
        self.lock().conflicts.insert(key.clone(), n);
    }

    /// Creates and updates of `key` fail with `reason`.
    pub fn fail_writes(&self, key: &ObjectKey, reason: &str) {
        self.lock().failing_writes.insert(key.clone(), reason.to_string());
    }

    pub fn fail_deletes(&self, key: &ObjectKey, reason: &str) {
        self.lock().failing_deletes.insert(key.clone(), reason.to_string());
    }

    pub fn counts(&self) -> WriteCounts {
        self.lock().counts
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn snapshot(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn matches_selector(obj: &DynamicObject, selector: &Selector) -> bool {
    let labels = obj.metadata.labels.as_ref();
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)).map(|x| x == v).unwrap_or(false))
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        Ok(self.lock().objects.get(key).cloned())
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .objects
            .iter()
            .filter(|(k, _)| k.object_kind() == Some(kind) && k.namespace.as_deref() == Some(namespace))
            .filter(|(_, o)| matches_selector(o, selector))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn list_registries(&self, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .objects
            .iter()
            .filter(|(k, _)| k.is_registry())
            .filter(|(k, _)| namespace.is_none() || k.namespace.as_deref() == namespace)
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::of(obj)?;
        let mut inner = self.lock();
        if let Some(reason) = inner.failing_writes.get(&key) {
            return Err(StoreError::Api(reason.clone()));
        }
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        let mut obj = obj.clone();
        obj.metadata.uid = None;
        obj.metadata.resource_version = None;
        let stored = inner.admit(obj);
        inner.objects.insert(key.clone(), stored.clone());
        inner.counts.creates += 1;
        trace!(object = %key, "memory create");
        Ok(stored)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::of(obj)?;
        let mut inner = self.lock();
        if let Some(reason) = inner.failing_writes.get(&key) {
            return Err(StoreError::Api(reason.clone()));
        }
        let Some(current) = inner.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound(key));
        };
        if let Some(n) = inner.conflicts.get_mut(&key) {
            if *n > 0 {
                *n -= 1;
                return Err(StoreError::Conflict { key, reason: "injected conflict".into() });
            }
        }
        if obj.metadata.resource_version.is_some() && obj.metadata.resource_version != current.metadata.resource_version {
            return Err(StoreError::Conflict { key, reason: "the object has been modified".into() });
        }
        let mut next = obj.clone();
        next.metadata.uid = current.metadata.uid.clone();
        next.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        match current.data.get("status") {
            Some(status) => next.data["status"] = status.clone(),
            None => {
                if let Some(map) = next.data.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        next.metadata.resource_version = Some(inner.next_rv());
        inner.objects.insert(key.clone(), next.clone());
        inner.counts.updates += 1;
        trace!(object = %key, "memory update");
        Ok(next)
    }

    async fn delete(&self, obj: &DynamicObject) -> Result<(), StoreError> {
        let key = ObjectKey::of(obj)?;
        let mut inner = self.lock();
        if let Some(reason) = inner.failing_deletes.get(&key) {
            return Err(StoreError::Api(reason.clone()));
        }
        let Some(current) = inner.objects.get(&key) else {
            return Err(StoreError::NotFound(key));
        };
        if obj.metadata.uid.is_some() && obj.metadata.uid != current.metadata.uid {
            return Err(StoreError::Conflict { key, reason: "uid precondition failed".into() });
        }
        inner.objects.remove(&key);
        inner.counts.deletes += 1;
        trace!(object = %key, "memory delete");
        Ok(())
    }

    async fn patch_status(&self, key: &ObjectKey, status: &serde_json::Value) -> Result<DynamicObject, StoreError> {
        let mut inner = self.lock();
        if !inner.objects.contains_key(key) {
            return Err(StoreError::NotFound(key.clone()));
        }
        let rv = inner.next_rv();
        let Some(obj) = inner.objects.get_mut(key) else {
            return Err(StoreError::NotFound(key.clone()));
        };
        if obj.data.get("status").is_none() {
            obj.data["status"] = serde_json::Value::Object(Default::default());
        }
        merge_patch(&mut obj.data["status"], status);
        obj.metadata.resource_version = Some(rv);
        let out = obj.clone();
        inner.counts.status_patches += 1;
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub regarding: String,
    pub kind: EventKind,
    pub message: String,
}

/// Event sink that keeps every published event.
#[derive(Default)]
pub struct MemoryEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<RecordedEvent> {
        self.events().into_iter().filter(|e| e.kind == kind).collect()
    }
}

#[async_trait]
impl EventSink for MemoryEvents {
    async fn publish(&self, regarding: &ObjectReference, kind: EventKind, message: String) {
        let regarding = format!(
            "{}/{}",
            regarding.namespace.as_deref().unwrap_or_default(),
            regarding.name.as_deref().unwrap_or_default()
        );
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(RecordedEvent { regarding, kind, message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn svc(name: &str, labels: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": name, "namespace": "ns", "labels": labels},
            "spec": {"ports": [{"port": 5000}]},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_selector() {
        let store = MemoryStore::new();
        store.insert(svc("a", json!({"app": "r", "tier": "x"}))).unwrap();
        store.insert(svc("b", json!({"app": "other"}))).unwrap();
        let mut other_ns = svc("c", json!({"app": "r"}));
        other_ns.metadata.namespace = Some("elsewhere".into());
        store.insert(other_ns).unwrap();

        let sel: Selector = [("app".to_string(), "r".to_string())].into_iter().collect();
        let found = store.list(ObjectKind::Service, "ns", &sel).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.name.as_deref(), Some("a"));
        assert!(store.list(ObjectKind::ConfigMap, "ns", &sel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = MemoryStore::new();
        let stored = store.insert(svc("a", json!({}))).unwrap();
        let mut first = stored.clone();
        first.data["spec"]["ports"] = json!([{"port": 5001}]);
        store.update(&first).await.unwrap();

        let err = store.update(&stored).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn injected_conflicts_are_consumed() {
        let store = MemoryStore::new();
        let stored = store.insert(svc("a", json!({}))).unwrap();
        let key = ObjectKey::of(&stored).unwrap();
        store.inject_conflicts(&key, 1);
        assert!(store.update(&stored).await.unwrap_err().is_conflict());
        assert!(store.update(&stored).await.is_ok());
    }

    #[tokio::test]
    async fn delete_checks_uid_precondition() {
        let store = MemoryStore::new();
        let stored = store.insert(svc("a", json!({}))).unwrap();
        let mut stale = stored.clone();
        stale.metadata.uid = Some("00000000-0000-0000-0000-000000000001".into());
        assert!(store.delete(&stale).await.unwrap_err().is_conflict());
        store.delete(&stored).await.unwrap();
        assert!(store.is_empty());
        assert!(store.delete(&stored).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn update_preserves_status_subresource() {
        let store = MemoryStore::new();
        let stored = store.insert(svc("a", json!({}))).unwrap();
        let key = ObjectKey::of(&stored).unwrap();
        let patched = store.patch_status(&key, &json!({"loadBalancer": {}})).await.unwrap();

        let mut next = patched.clone();
        next.data["status"] = json!({"bogus": true});
        let updated = store.update(&next).await.unwrap();
        assert_eq!(updated.data["status"], json!({"loadBalancer": {}}));
        assert_eq!(store.counts(), WriteCounts { creates: 0, updates: 1, deletes: 0, status_patches: 1 });
    }

    #[tokio::test]
    async fn events_are_recorded() {
        let events = MemoryEvents::new();
        let regarding = ObjectReference { name: Some("r".into()), namespace: Some("ns".into()), ..Default::default() };
        events.publish(&regarding, EventKind::Error, "boom".into()).await;
        assert_eq!(
            events.of_kind(EventKind::Error),
            vec![RecordedEvent { regarding: "ns/r".into(), kind: EventKind::Error, message: "boom".into() }]
        );
    }
}
