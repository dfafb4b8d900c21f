//! Object identity for everything the operator manages.

use std::fmt;

use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Binary form of `metadata.uid`.
pub type Uid = [u8; 16];

/// Kinds the operator knows how to converge. The set is closed: adding a kind
/// means adding a merge rule for it as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    ConfigMap,
    Secret,
    Service,
    PersistentVolumeClaim,
    Deployment,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 5] = [
        ObjectKind::ConfigMap,
        ObjectKind::Secret,
        ObjectKind::Service,
        ObjectKind::PersistentVolumeClaim,
        ObjectKind::Deployment,
    ];

    pub fn group(self) -> &'static str {
        match self {
            ObjectKind::Deployment => "apps",
            _ => "",
        }
    }

    pub fn version(self) -> &'static str {
        "v1"
    }

    pub fn api_version(self) -> &'static str {
        match self {
            ObjectKind::Deployment => "apps/v1",
            _ => "v1",
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            ObjectKind::ConfigMap => "ConfigMap",
            ObjectKind::Secret => "Secret",
            ObjectKind::Service => "Service",
            ObjectKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ObjectKind::Deployment => "Deployment",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            ObjectKind::ConfigMap => "configmaps",
            ObjectKind::Secret => "secrets",
            ObjectKind::Service => "services",
            ObjectKind::PersistentVolumeClaim => "persistentvolumeclaims",
            ObjectKind::Deployment => "deployments",
        }
    }

    /// Resolve `apiVersion` + `kind` to a managed kind, if it is one.
    pub fn from_type(api_version: &str, kind: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.api_version() == api_version && k.kind() == kind)
    }

    pub fn api_resource(self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(self.group(), self.version(), self.kind());
        ApiResource::from_gvk_with_plural(&gvk, self.plural())
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("object has no apiVersion/kind")]
    MissingType,
    #[error("{kind} object has no metadata.name")]
    MissingName { kind: String },
}

/// Store-level identity of an object: type plus namespaced name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ObjectKind, namespace: &str, name: &str) -> Self {
        Self {
            api_version: kind.api_version().to_string(),
            kind: kind.kind().to_string(),
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    pub fn registry(namespace: &str, name: &str) -> Self {
        Self {
            api_version: crate::registry::API_VERSION.to_string(),
            kind: crate::registry::KIND.to_string(),
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    pub fn of(obj: &DynamicObject) -> Result<Self, IdentityError> {
        let types = obj.types.as_ref().ok_or(IdentityError::MissingType)?;
        if types.api_version.is_empty() || types.kind.is_empty() {
            return Err(IdentityError::MissingType);
        }
        let name = obj
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| IdentityError::MissingName { kind: types.kind.clone() })?;
        Ok(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone(),
            name,
        })
    }

    pub fn object_kind(&self) -> Option<ObjectKind> {
        ObjectKind::from_type(&self.api_version, &self.kind)
    }

    pub fn is_registry(&self) -> bool {
        self.api_version == crate::registry::API_VERSION && self.kind == crate::registry::KIND
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Observable outcome of converging one desired object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationResult::Created => "created",
            OperationResult::Updated => "updated",
            OperationResult::Unchanged => "unchanged",
        })
    }
}

pub fn parse_uid(uid_str: &str) -> Result<Uid, uuid::Error> {
    let u = uuid::Uuid::parse_str(uid_str)?;
    Ok(*u.as_bytes())
}

/// UID of a stored object; `None` when missing or not a UUID.
pub fn uid_of(obj: &DynamicObject) -> Option<Uid> {
    obj.metadata.uid.as_deref().and_then(|s| parse_uid(s).ok())
}

/// Convert any serializable Kubernetes type (typed `k8s-openapi` structs,
/// `Registry`) into a `DynamicObject`.
pub fn to_dynamic<T: Serialize>(obj: &T) -> Result<DynamicObject, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

pub fn from_dynamic<T: DeserializeOwned>(obj: &DynamicObject) -> Result<T, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn from_type_resolves_only_known_kinds() {
        assert_eq!(ObjectKind::from_type("apps/v1", "Deployment"), Some(ObjectKind::Deployment));
        assert_eq!(ObjectKind::from_type("v1", "Service"), Some(ObjectKind::Service));
        assert_eq!(ObjectKind::from_type("v1", "Deployment"), None);
        assert_eq!(ObjectKind::from_type("batch/v1", "CronJob"), None);
    }

    #[test]
    fn api_resource_carries_plural() {
        let ar = ObjectKind::PersistentVolumeClaim.api_resource();
        assert_eq!(ar.plural, "persistentvolumeclaims");
        assert_eq!(ar.api_version, "v1");
        let ar = ObjectKind::Deployment.api_resource();
        assert_eq!(ar.api_version, "apps/v1");
    }

    #[test]
    fn key_of_typed_object_round_trips_through_dynamic() {
        let cm = ConfigMap {
            metadata: ObjectMeta { name: Some("c".into()), namespace: Some("ns".into()), ..Default::default() },
            ..Default::default()
        };
        let dynobj = to_dynamic(&cm).unwrap();
        let key = ObjectKey::of(&dynobj).unwrap();
        assert_eq!(key, ObjectKey::new(ObjectKind::ConfigMap, "ns", "c"));
        assert_eq!(key.to_string(), "ConfigMap ns/c");
        let back: ConfigMap = from_dynamic(&dynobj).unwrap();
        assert_eq!(back, cm);
    }

    #[test]
    fn key_requires_name() {
        let cm = ConfigMap::default();
        let dynobj = to_dynamic(&cm).unwrap();
        assert_eq!(
            ObjectKey::of(&dynobj).unwrap_err(),
            IdentityError::MissingName { kind: "ConfigMap".into() }
        );
    }

    #[test]
    fn parse_uid_accepts_uuid_only() {
        assert!(parse_uid("6c1e7a52-0f5e-4a55-9a55-2c2b8b0e2d11").is_ok());
        assert!(parse_uid("not-a-uid").is_err());
    }
}
