//! Secondary watches: S3 credential Secrets are not owned by any Registry,
//! so changes to them are mapped back to the instances that read them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::runtime::reflector::ObjectRef;
use registry_core::{Registry, S3Storage, Storage};
use tracing::debug;

type SecretData = Option<BTreeMap<String, ByteString>>;

/// True when any of the S3 selectors names the Secret `name`.
pub fn reads_secret(s3: &S3Storage, name: &str) -> bool {
    [Some(&s3.bucket_name), Some(&s3.region), s3.access_key.as_ref(), s3.secret_key.as_ref(), s3.endpoint_url.as_ref()]
        .into_iter()
        .flatten()
        .any(|sel| sel.name == name)
}

/// Registries in `namespace` whose S3 storage reads the Secret `name`.
pub fn registries_reading(namespace: &str, name: &str, registries: &[Arc<Registry>]) -> Vec<ObjectRef<Registry>> {
    registries
        .iter()
        .filter(|r| r.namespace() == namespace)
        .filter(|r| matches!(&r.spec.storage, Some(Storage::S3(s3)) if reads_secret(s3, name)))
        .map(|r| ObjectRef::from_obj(r.as_ref()))
        .collect()
}

/// Last `data` seen per Secret. Only a first sighting or a change to `data`
/// counts; metadata-only updates and relists do not.
#[derive(Default)]
pub struct SecretChanges {
    seen: Mutex<HashMap<(String, String), SecretData>>,
}

impl SecretChanges {
    pub fn observe(&self, secret: &Secret) -> bool {
        let key = (secret.metadata.namespace.clone().unwrap_or_default(), secret.metadata.name.clone().unwrap_or_default());
        let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match seen.get(&key) {
            Some(data) if *data == secret.data => false,
            _ => {
                seen.insert(key, secret.data.clone());
                true
            }
        }
    }
}

/// Map a Secret event to the registries that must rebuild their
/// configuration.
pub fn map_secret(secret: &Secret, registries: &[Arc<Registry>], changes: &SecretChanges) -> Vec<ObjectRef<Registry>> {
    let (Some(namespace), Some(name)) = (secret.metadata.namespace.as_deref(), secret.metadata.name.as_deref()) else {
        return Vec::new();
    };
    let targets = registries_reading(namespace, name, registries);
    if targets.is_empty() || !changes.observe(secret) {
        return Vec::new();
    }
    debug!(secret = %name, namespace, registries = targets.len(), "s3 secret changed");
    targets
}
