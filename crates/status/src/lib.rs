//! Registry status: rolls the Deployment state up into the instance status
//! and reports the outcome of a pass through events.

#![forbid(unsafe_code)]

use k8s_openapi::api::apps::v1::Deployment;
use registry_apply::{ConvergeError, ConvergeReport};
use registry_core::{from_dynamic, EventKind, EventSink, ObjectKey, ObjectKind, Registry, RegistryStatus};
use registry_manifests::naming;
use registry_store::{ObjectStore, StoreError};
use registry_upgrade::MigrationChain;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const APPLIED: &str = "Applied status changes";

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error(transparent)]
    Converge(#[from] ConvergeError),
    #[error("failed to get deployment {0}: not found")]
    MissingDeployment(ObjectKey),
    #[error("failed to get deployment {key}: {source}")]
    Deployment {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error("decoding deployment {key}: {source}")]
    Decode {
        key: ObjectKey,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to apply status changes to the Registry CR: {0}")]
    Patch(#[source] StoreError),
    #[error("encoding status: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("cancelled")]
    Cancelled,
}

impl StatusError {
    /// Worth another pass without a change to the instance.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StatusError::Cancelled | StatusError::Encode(_))
    }
}

/// Observed state of the registry Deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rollup {
    pub replicas: i32,
    pub ready_replicas: i32,
    pub image: String,
}

impl Rollup {
    pub fn ready(&self) -> bool {
        self.replicas != 0 && self.replicas == self.ready_replicas
    }

    pub fn from_deployment(d: &Deployment) -> Self {
        let status = d.status.clone().unwrap_or_default();
        let image = d
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first())
            .and_then(|c| c.image.clone())
            .unwrap_or_default();
        Self { replicas: status.replicas.unwrap_or(0), ready_replicas: status.ready_replicas.unwrap_or(0), image }
    }

    pub fn apply(&self, status: &mut RegistryStatus) {
        status.ready = self.ready();
        status.image = self.image.clone();
    }
}

/// What the reporter did with the instance status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    Patched(RegistryStatus),
    Unchanged,
    /// Migration failed; the status was left as stored.
    Skipped,
}

async fn cancellable<T>(
    token: &CancellationToken,
    op: impl std::future::Future<Output = Result<T, StoreError>>,
) -> Result<Result<T, StoreError>, StatusError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(StatusError::Cancelled),
        r = op => Ok(r),
    }
}

/// Read the registry Deployment and summarize it.
pub async fn rollup<S>(store: &S, registry: &Registry, token: &CancellationToken) -> Result<Rollup, StatusError>
where
    S: ObjectStore + ?Sized,
{
    let key = ObjectKey::new(ObjectKind::Deployment, registry.namespace(), &naming::deployment(registry.name()));
    let obj = cancellable(token, store.get(&key))
        .await?
        .map_err(|source| StatusError::Deployment { key: key.clone(), source })?
        .ok_or_else(|| StatusError::MissingDeployment(key.clone()))?;
    let d: Deployment = from_dynamic(&obj).map_err(|source| StatusError::Decode { key, source })?;
    Ok(Rollup::from_deployment(&d))
}

/// Finish a reconcile pass: surface a convergence failure, migrate the
/// version marker, roll up the Deployment and patch the status if it moved.
pub async fn report<S, E>(
    store: &S,
    events: &E,
    chain: &MigrationChain,
    registry: &Registry,
    converged: Result<ConvergeReport, ConvergeError>,
    token: &CancellationToken,
) -> Result<StatusChange, StatusError>
where
    S: ObjectStore + ?Sized,
    E: EventSink + ?Sized,
{
    let regarding = registry.object_reference();
    if let Err(e) = converged {
        events.publish(&regarding, EventKind::Error, e.to_string()).await;
        return Err(e.into());
    }

    let mut changed = match chain.migrate(registry.clone()) {
        Ok(r) => r,
        Err(e) => {
            warn!(registry = %registry.name(), error = %e, "failed to upgrade the Registry CR");
            events.publish(&regarding, EventKind::Error, e.to_string()).await;
            return Ok(StatusChange::Skipped);
        }
    };
    if changed.status.version.is_empty() {
        changed.status.version = chain.target().to_string();
    }

    match rollup(store, registry, token).await {
        Ok(r) => r.apply(&mut changed.status),
        Err(StatusError::Cancelled) => return Err(StatusError::Cancelled),
        Err(e) => {
            events.publish(&regarding, EventKind::StatusFailure, e.to_string()).await;
            return Err(e);
        }
    }

    if changed.status == registry.status {
        debug!(registry = %registry.name(), "status unchanged");
        return Ok(StatusChange::Unchanged);
    }
    let key = ObjectKey::registry(registry.namespace(), registry.name());
    let patch = serde_json::to_value(&changed.status)?;
    cancellable(token, store.patch_status(&key, &patch)).await?.map_err(StatusError::Patch)?;
    events.publish(&regarding, EventKind::Info, APPLIED.to_string()).await;
    debug!(registry = %registry.name(), ready = changed.status.ready, version = %changed.status.version, "status patched");
    Ok(StatusChange::Patched(changed.status))
}
