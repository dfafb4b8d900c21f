//! Object-store seam for the registry operator.
//!
//! The convergence engine, the status reporter and the controller only talk
//! to the cluster through [`ObjectStore`]. `registry-kubehub` implements it on
//! top of kube-rs; [`MemoryStore`] implements it in RAM for tests and offline
//! rendering.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::core::DynamicObject;
use registry_core::{IdentityError, ObjectKey, ObjectKind, OperationResult};
use tracing::debug;

mod memory;

pub use memory::{MemoryEvents, MemoryStore, RecordedEvent, WriteCounts};

/// Label selector: every pair must be present on a listed object.
pub type Selector = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ObjectKey),
    #[error("conflict writing {key}: {reason}")]
    Conflict { key: ObjectKey, reason: String },
    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("store request failed: {0}")]
    Api(String),
}

impl StoreError {
    /// Optimistic-concurrency failure: re-read and try again.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError>;

    /// Objects of `kind` in `namespace` carrying every label in `selector`.
    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>, StoreError>;

    /// All Registry instances, optionally restricted to one namespace.
    async fn list_registries(&self, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Replace an object. Fails with [`StoreError::Conflict`] when
    /// `metadata.resourceVersion` is stale.
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Delete an object, guarded by its `metadata.uid` when one is set.
    async fn delete(&self, obj: &DynamicObject) -> Result<(), StoreError>;

    /// Merge-patch the status subresource.
    async fn patch_status(&self, key: &ObjectKey, status: &serde_json::Value) -> Result<DynamicObject, StoreError>;
}

/// Read the object named by `template`; create it from the mutated template
/// when absent, otherwise mutate a copy of the stored object and update it
/// unless the mutation changed nothing.
///
/// `mutate` receives `exists = true` when it is working on the stored copy.
pub async fn create_or_update<S, E, F>(
    store: &S,
    template: DynamicObject,
    mutate: F,
) -> Result<(OperationResult, DynamicObject), E>
where
    S: ObjectStore + ?Sized,
    E: From<StoreError>,
    F: FnOnce(&mut DynamicObject, bool) -> Result<(), E>,
{
    let key = ObjectKey::of(&template).map_err(StoreError::from)?;
    match store.get(&key).await? {
        None => {
            let mut obj = template;
            mutate(&mut obj, false)?;
            let created = store.create(&obj).await?;
            debug!(object = %key, "created");
            Ok((OperationResult::Created, created))
        }
        Some(existing) => {
            let mut obj = existing.clone();
            mutate(&mut obj, true)?;
            if same_content(&existing, &obj) {
                return Ok((OperationResult::Unchanged, existing));
            }
            let updated = store.update(&obj).await?;
            debug!(object = %key, "updated");
            Ok((OperationResult::Updated, updated))
        }
    }
}

fn same_content(a: &DynamicObject, b: &DynamicObject) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    use serde_json::Value;
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(target_map) = target {
        for (k, v) in patch_map {
            if v.is_null() {
                target_map.remove(k);
            } else {
                merge_patch(target_map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}
