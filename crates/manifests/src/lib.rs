//! Registry manifests: the desired state of one `Registry` instance.
//!
//! [`build`] turns an instance into the ordered list of objects the
//! convergence engine applies: configuration Secret, storage claim (only for
//! `persistentVolumeClaim` storage), Deployment and Service.

#![forbid(unsafe_code)]

use kube::core::DynamicObject;
use registry_core::{to_dynamic, Registry, Storage};
use registry_store::{ObjectStore, StoreError};
use tracing::debug;

pub mod config;
pub mod labels;
pub mod naming;
pub mod objects;

pub use config::{content_hash, DistributionConfig};
pub use labels::{selector_labels, Filters};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid filter pattern {pattern:?}: {source}")]
    Filter { pattern: String, source: regex::Error },
    #[error("reading S3 storage settings: {0}")]
    Secrets(String),
    #[error("invalid endpoint URL {0:?}")]
    Endpoint(String),
    #[error("rendering distribution configuration: {0}")]
    Render(#[from] serde_yaml::Error),
    #[error("converting {kind}: {source}")]
    Convert { kind: &'static str, source: serde_json::Error },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Builder inputs that do not come from the instance.
#[derive(Debug, Clone)]
pub struct BuildParams {
    /// Image used when the instance leaves `spec.image` empty.
    pub default_image: String,
    pub label_filters: Filters,
    pub annotation_filters: Filters,
}

impl BuildParams {
    pub fn new(default_image: impl Into<String>) -> Self {
        Self {
            default_image: default_image.into(),
            label_filters: Filters::default(),
            annotation_filters: Filters::default(),
        }
    }

    pub fn with_filters<S: AsRef<str>>(mut self, labels: &[S], annotations: &[S]) -> Result<Self, BuildError> {
        self.label_filters = Filters::new(labels)?;
        self.annotation_filters = Filters::new(annotations)?;
        Ok(self)
    }
}

fn dynamic<T: serde::Serialize>(kind: &'static str, obj: &T) -> Result<DynamicObject, BuildError> {
    to_dynamic(obj).map_err(|source| BuildError::Convert { kind, source })
}

/// Desired objects for `registry`, in apply order. Reads S3 credential
/// Secrets through `store` when S3 storage is selected; nothing is written.
pub async fn build<S>(store: &S, registry: &Registry, params: &BuildParams) -> Result<Vec<DynamicObject>, BuildError>
where
    S: ObjectStore + ?Sized,
{
    let cfg = config::render(store, registry).await?;
    let yaml = cfg.to_yaml()?;
    let hash = content_hash(&yaml);
    let secret_name = naming::config_secret(registry.name(), &hash);

    let mut out = vec![dynamic("Secret", &objects::config_secret(registry, params, &secret_name, &yaml))?];
    if let Some(Storage::PersistentVolumeClaim(pvc)) = &registry.spec.storage {
        out.push(dynamic("PersistentVolumeClaim", &objects::storage_claim(registry, params, pvc))?);
    }
    out.push(dynamic("Deployment", &objects::deployment(registry, params, &secret_name))?);
    out.push(dynamic("Service", &objects::service(registry, params))?);
    debug!(registry = %registry.name(), objects = out.len(), config = %secret_name, "desired state built");
    Ok(out)
}
