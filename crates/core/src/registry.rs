//! The `Registry` custom resource (`registry-operator.dev/v1alpha1`).

use std::borrow::Cow;

use k8s_openapi::api::core::v1::{Affinity, EmptyDirVolumeSource, ObjectReference, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::TypeMeta;
use kube::Resource;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "registry-operator.dev";
pub const VERSION: &str = "v1alpha1";
pub const API_VERSION: &str = "registry-operator.dev/v1alpha1";
pub const KIND: &str = "Registry";
pub const PLURAL: &str = "registries";

/// Size limit given to the scratch volume when no storage is configured.
pub const DEFAULT_EMPTY_DIR_LIMIT: &str = "200Mi";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: RegistrySpec,
    #[serde(default)]
    pub status: RegistryStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    /// Container image; the embedded default is used when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Storage>,
}

/// Storage backend for the registry. Exactly one variant is active; a
/// document naming two backends does not deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Storage {
    EmptyDir(EmptyDirVolumeSource),
    PersistentVolumeClaim(PvcStorage),
    S3(S3Storage),
}

impl Storage {
    pub fn default_empty_dir() -> Self {
        Storage::EmptyDir(EmptyDirVolumeSource {
            medium: None,
            size_limit: Some(Quantity(DEFAULT_EMPTY_DIR_LIMIT.to_string())),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PvcStorage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    pub size: Quantity,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Storage {
    pub bucket_name: SecretKeySelector,
    pub region: SecretKeySelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<SecretKeySelector>,
}

/// Reference to one key of a Secret in the instance namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    #[serde(default)]
    pub ready: bool,
    /// Version marker of the last completed migration.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("spec.replicas must not be negative (got {0})")]
    NegativeReplicas(i32),
    #[error("spec.storage.persistentVolumeClaim.size must be set")]
    MissingPvcSize,
    #[error("spec.storage.s3.{0}.name and .key must be set")]
    IncompleteSecretRef(&'static str),
}

impl Registry {
    pub fn new(namespace: &str, name: &str, spec: RegistrySpec) -> Self {
        Self {
            types: Some(TypeMeta { api_version: API_VERSION.to_string(), kind: KIND.to_string() }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec,
            status: RegistryStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|x| x == finalizer))
            .unwrap_or(false)
    }

    /// Returns true when the finalizer was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.metadata.finalizers.get_or_insert_with(Vec::new).push(finalizer.to_string());
        true
    }

    /// Returns true when the finalizer was present and removed.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let Some(list) = self.metadata.finalizers.as_mut() else { return false };
        let before = list.len();
        list.retain(|x| x != finalizer);
        before != list.len()
    }

    /// Fill in what admission defaulting would: one replica and a bounded
    /// scratch volume when no storage is configured.
    pub fn with_defaults(mut self) -> Self {
        if self.spec.replicas.is_none() {
            self.spec.replicas = Some(1);
        }
        if self.spec.storage.is_none() {
            self.spec.storage = Some(Storage::default_empty_dir());
        }
        if self.types.is_none() {
            self.types = Some(TypeMeta { api_version: API_VERSION.to_string(), kind: KIND.to_string() });
        }
        self
    }

    /// Validate the spec. Returns warnings that do not block reconciliation.
    pub fn validate(&self) -> Result<Vec<String>, ValidationError> {
        let mut warnings = Vec::new();
        if let Some(r) = self.spec.replicas {
            if r < 0 {
                return Err(ValidationError::NegativeReplicas(r));
            }
        }
        match &self.spec.storage {
            Some(Storage::PersistentVolumeClaim(pvc)) => {
                if pvc.size.0.is_empty() {
                    return Err(ValidationError::MissingPvcSize);
                }
            }
            Some(Storage::S3(s3)) => {
                let refs = [
                    ("bucketName", Some(&s3.bucket_name)),
                    ("region", Some(&s3.region)),
                    ("accessKey", s3.access_key.as_ref()),
                    ("secretKey", s3.secret_key.as_ref()),
                    ("endpointURL", s3.endpoint_url.as_ref()),
                ];
                for (field, sel) in refs {
                    if let Some(sel) = sel {
                        if sel.name.is_empty() || sel.key.is_empty() {
                            return Err(ValidationError::IncompleteSecretRef(field));
                        }
                    }
                }
            }
            _ => {}
        }
        let shared_storage = matches!(self.spec.storage, Some(Storage::S3(_)));
        if self.replicas() > 1 && !shared_storage {
            warnings.push(
                "If replicas > 1 and file/block storage is used, there is no data consistency between Registry replicas."
                    .to_string(),
            );
        }
        Ok(warnings)
    }

    pub fn object_reference(&self) -> ObjectReference {
        self.object_ref(&())
    }
}

impl Resource for Registry {
    type DynamicType = ();
    type Scope = k8s_openapi::NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        KIND.into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        PLURAL.into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(doc: serde_json::Value) -> Result<Registry, serde_json::Error> {
        serde_json::from_value(doc)
    }

    #[test]
    fn storage_accepts_a_single_backend() {
        let r = parse(serde_json::json!({
            "apiVersion": API_VERSION, "kind": KIND,
            "metadata": {"name": "r", "namespace": "ns"},
            "spec": {"storage": {"emptyDir": {"sizeLimit": "1Gi"}}}
        }))
        .unwrap();
        match r.spec.storage {
            Some(Storage::EmptyDir(ed)) => assert_eq!(ed.size_limit, Some(Quantity("1Gi".into()))),
            other => panic!("unexpected storage: {:?}", other),
        }
    }

    #[test]
    fn storage_rejects_two_backends() {
        let err = parse(serde_json::json!({
            "metadata": {"name": "r"},
            "spec": {"storage": {
                "emptyDir": {},
                "persistentVolumeClaim": {"size": "1Gi"}
            }}
        }));
        assert!(err.is_err());
    }

    #[test]
    fn defaults_fill_replicas_and_storage() {
        let r = Registry::new("ns", "r", RegistrySpec::default()).with_defaults();
        assert_eq!(r.spec.replicas, Some(1));
        assert_eq!(r.spec.storage, Some(Storage::default_empty_dir()));
    }

    #[test]
    fn validate_rejects_negative_replicas_and_warns_on_scale_out() {
        let mut r = Registry::new("ns", "r", RegistrySpec { replicas: Some(-1), ..Default::default() });
        assert_eq!(r.validate(), Err(ValidationError::NegativeReplicas(-1)));
        r.spec.replicas = Some(3);
        let warnings = r.validate().unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn validate_checks_secret_refs() {
        let r = Registry::new(
            "ns",
            "r",
            RegistrySpec {
                storage: Some(Storage::S3(S3Storage {
                    bucket_name: SecretKeySelector { name: "s".into(), key: "bucket".into() },
                    region: SecretKeySelector { name: "s".into(), key: String::new() },
                    ..Default::default()
                })),
                ..Default::default()
            },
        );
        assert_eq!(r.validate(), Err(ValidationError::IncompleteSecretRef("region")));
    }

    #[test]
    fn finalizers_are_added_once_and_removed() {
        let mut r = Registry::new("ns", "r", RegistrySpec::default());
        assert!(r.add_finalizer("f"));
        assert!(!r.add_finalizer("f"));
        assert!(r.has_finalizer("f"));
        assert!(r.remove_finalizer("f"));
        assert!(!r.remove_finalizer("f"));
    }

    #[test]
    fn object_reference_points_at_the_instance() {
        let mut r = Registry::new("ns", "r", RegistrySpec::default());
        r.metadata.uid = Some("6c1e7a52-0f5e-4a55-9a55-2c2b8b0e2d11".into());
        let or = r.object_reference();
        assert_eq!(or.kind.as_deref(), Some(KIND));
        assert_eq!(or.api_version.as_deref(), Some(API_VERSION));
        assert_eq!(or.name.as_deref(), Some("r"));
    }
}
