//! Ownership tracker: what an instance currently owns, keyed by UID.

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use registry_core::{uid_of, ObjectKey, ObjectKind, Uid};
use registry_store::{ObjectStore, Selector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ApplyError;

/// UID-keyed view of the objects one owner has in the store.
///
/// Built fresh every pass and consumed by it: the convergence engine removes
/// every object it reconciles, and whatever is left gets pruned.
#[derive(Debug, Clone, Default)]
pub struct OwnershipIndex {
    objects: BTreeMap<Uid, DynamicObject>,
}

impl OwnershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the object has no usable UID.
    pub fn insert(&mut self, obj: DynamicObject) -> bool {
        match uid_of(&obj) {
            Some(uid) => {
                self.objects.insert(uid, obj);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, uid: &Uid) -> Option<DynamicObject> {
        self.objects.remove(uid)
    }

    /// Remove the entry whose identity is `key`, whatever its UID.
    pub fn take_key(&mut self, key: &ObjectKey) -> Option<DynamicObject> {
        let uid = self
            .objects
            .iter()
            .find(|(_, o)| ObjectKey::of(o).map(|k| &k == key).unwrap_or(false))
            .map(|(uid, _)| *uid)?;
        self.objects.remove(&uid)
    }

    pub fn contains_key(&self, key: &ObjectKey) -> bool {
        self.objects.values().any(|o| ObjectKey::of(o).map(|k| &k == key).unwrap_or(false))
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.objects.values().filter_map(|o| ObjectKey::of(o).ok()).collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn drain(&mut self) -> Vec<DynamicObject> {
        std::mem::take(&mut self.objects).into_values().collect()
    }
}

fn carries(obj: &DynamicObject, namespace: &str, selector: &Selector) -> bool {
    let labels = obj.metadata.labels.as_ref();
    obj.metadata.namespace.as_deref() == Some(namespace)
        && selector
            .iter()
            .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

/// List every object of `kinds` in `namespace` that carries all `selector`
/// labels. Read-only.
pub async fn find_owned<S>(
    store: &S,
    namespace: &str,
    selector: &Selector,
    kinds: &[ObjectKind],
    token: &CancellationToken,
) -> Result<OwnershipIndex, ApplyError>
where
    S: ObjectStore + ?Sized,
{
    let mut index = OwnershipIndex::new();
    for kind in kinds {
        let listed = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ApplyError::Cancelled),
            r = store.list(*kind, namespace, selector) => r?,
        };
        for obj in listed {
            if !carries(&obj, namespace, selector) {
                continue;
            }
            let name = obj.metadata.name.clone();
            if !index.insert(obj) {
                warn!(kind = %kind, name = ?name, "owned object without a uid; skipping");
            }
        }
    }
    debug!(ns = %namespace, owned = index.len(), "ownership index built");
    Ok(index)
}
