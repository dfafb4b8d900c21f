//! Registry controller: one reconcile pass end to end.
//!
//! [`Reconciler::reconcile`] is what the scheduler calls for one instance:
//! fetch, default and validate, finalizer bookkeeping, build the desired
//! objects, collect what the instance already owns, converge, report status.
//! [`run`] drives it from the kube runtime.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use registry_apply::{find_owned, ApplyError, ConvergeReport, Converger};
use registry_core::{from_dynamic, to_dynamic, EventKind, EventSink, ObjectKey, ObjectKind, Registry, ValidationError};
use registry_manifests::{build, selector_labels, BuildError, BuildParams};
use registry_status::{StatusChange, StatusError};
use registry_store::{ObjectStore, StoreError};
use registry_upgrade::MigrationChain;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod runtime;
pub mod watches;

pub use runtime::{run, RunConfig};

pub const FINALIZER: &str = "registry.registry-operator.dev/finalizer";

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("decoding registry {key}: {source}")]
    Decode {
        key: ObjectKey,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid registry: {0}")]
    Invalid(#[from] ValidationError),
    #[error("building desired state: {0}")]
    Build(#[from] BuildError),
    #[error("listing owned objects: {0}")]
    Owned(#[source] ApplyError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Errors that can clear up on their own (API hiccups, missing Secrets,
    /// conflicts). The rest wait for the instance to change.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Store(_) | ReconcileError::Owned(_) => true,
            ReconcileError::Build(BuildError::Secrets(_) | BuildError::Store(_)) => true,
            ReconcileError::Status(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result of one pass.
#[derive(Debug)]
pub enum Pass {
    /// The instance no longer exists.
    Gone,
    /// The instance is being deleted and our finalizer was released.
    Finalized,
    Reconciled { report: ConvergeReport, status: StatusChange },
}

/// Everything a pass needs, built once at startup.
pub struct Reconciler<S, E> {
    pub store: S,
    pub events: E,
    pub chain: MigrationChain,
    pub params: BuildParams,
    pub converger: Converger,
}

impl<S, E> Reconciler<S, E>
where
    S: ObjectStore,
    E: EventSink,
{
    pub fn new(store: S, events: E, chain: MigrationChain, params: BuildParams, converger: Converger) -> Self {
        Self { store, events, chain, params, converger }
    }

    async fn guarded<T>(
        &self,
        token: &CancellationToken,
        op: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, ReconcileError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ReconcileError::Cancelled),
            r = op => Ok(r?),
        }
    }

    async fn fetch(&self, key: &ObjectKey, token: &CancellationToken) -> Result<Option<Registry>, ReconcileError> {
        let Some(obj) = self.guarded(token, self.store.get(key)).await? else {
            return Ok(None);
        };
        let registry = from_dynamic(&obj).map_err(|source| ReconcileError::Decode { key: key.clone(), source })?;
        Ok(Some(registry))
    }

    async fn write(&self, key: &ObjectKey, registry: &Registry, token: &CancellationToken) -> Result<Registry, ReconcileError> {
        let obj = to_dynamic(registry).map_err(|source| ReconcileError::Decode { key: key.clone(), source })?;
        let stored = self.guarded(token, self.store.update(&obj)).await?;
        from_dynamic(&stored).map_err(|source| ReconcileError::Decode { key: key.clone(), source })
    }

    /// Run one pass for `namespace/name`.
    pub async fn reconcile(&self, namespace: &str, name: &str, token: &CancellationToken) -> Result<Pass, ReconcileError> {
        let t0 = Instant::now();
        let key = ObjectKey::registry(namespace, name);
        debug!(registry = %key, "reconcile: start");
        let res = self.pass(&key, token).await;
        let label = match &res {
            Ok(Pass::Reconciled { .. }) => "reconciled",
            Ok(Pass::Gone) => "gone",
            Ok(Pass::Finalized) => "finalized",
            Err(_) => "error",
        };
        counter!("reconcile_passes", 1u64, "result" => label);
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(_) => info!(registry = %key, result = label, took_ms = %t0.elapsed().as_millis(), "reconcile: done"),
            Err(e) => warn!(registry = %key, error = %e, took_ms = %t0.elapsed().as_millis(), "reconcile: failed"),
        }
        res
    }

    async fn pass(&self, key: &ObjectKey, token: &CancellationToken) -> Result<Pass, ReconcileError> {
        let Some(mut registry) = self.fetch(key, token).await? else {
            debug!(registry = %key, "registry not found; nothing to do");
            return Ok(Pass::Gone);
        };

        if registry.is_deleting() {
            // Owned objects carry owner references; garbage collection removes them.
            if registry.remove_finalizer(FINALIZER) {
                self.write(key, &registry, token).await?;
                info!(registry = %key, "finalizer released");
                return Ok(Pass::Finalized);
            }
            return Ok(Pass::Gone);
        }
        if registry.add_finalizer(FINALIZER) {
            registry = self.write(key, &registry, token).await?;
            debug!(registry = %key, "finalizer added");
        }

        let registry = registry.with_defaults();
        let regarding = registry.object_reference();
        match registry.validate() {
            Ok(warnings) => {
                for w in warnings {
                    warn!(registry = %key, "{w}");
                }
            }
            Err(e) => {
                self.events.publish(&regarding, EventKind::Error, e.to_string()).await;
                return Err(e.into());
            }
        }

        let desired = match build(&self.store, &registry, &self.params).await {
            Ok(d) => d,
            Err(e) => {
                self.events.publish(&regarding, EventKind::Error, e.to_string()).await;
                return Err(e.into());
            }
        };
        let mut owned = find_owned(&self.store, registry.namespace(), &selector_labels(&registry), &ObjectKind::ALL, token)
            .await
            .map_err(|e| match e {
                ApplyError::Cancelled => ReconcileError::Cancelled,
                e => ReconcileError::Owned(e),
            })?;
        debug!(registry = %key, desired = desired.len(), owned = owned.len(), "reconcile: converging");

        let converged = self.converger.converge(&self.store, &registry, &desired, &mut owned, token).await;
        if let Err(registry_apply::ConvergeError::Cancelled) = converged {
            return Err(ReconcileError::Cancelled);
        }
        let report = converged.as_ref().ok().cloned().unwrap_or_default();
        let status = registry_status::report(&self.store, &self.events, &self.chain, &registry, converged, token)
            .await
            .map_err(|e| match e {
                StatusError::Cancelled => ReconcileError::Cancelled,
                e => ReconcileError::Status(e),
            })?;
        Ok(Pass::Reconciled { report, status })
    }
}

/// How long to wait before retrying a failed pass.
pub fn retry_delay(error: &ReconcileError, requeue: Duration) -> Option<Duration> {
    error.is_retryable().then_some(requeue)
}
