//! Registry upgrade: carries stored instances across operator releases.
//!
//! A [`MigrationChain`] holds the release steps and the target version. At
//! startup [`upgrade_managed_instances`] runs every stored instance through
//! it and persists the ones that changed.

#![forbid(unsafe_code)]

use std::future::Future;

use registry_core::{from_dynamic, to_dynamic, EventKind, EventSink, ObjectKey, Registry};
use registry_store::{ObjectStore, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod chain;
pub mod steps;
pub mod version;

pub use chain::{
    parse_marker, ChainError, MigrationChain, MigrationError, MigrationStep, StepContext, StepError, Transform,
};
pub use version::VersionInfo;

pub const UPGRADE_FAILED: &str =
    "Automated update not possible. Configuration must be corrected manually and CR instance must be re-created.";

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("failed to list registries: {0}")]
    List(#[source] StoreError),
    #[error("cancelled")]
    Cancelled,
}

/// Per-instance tally of one startup upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeSummary {
    pub upgraded: Vec<ObjectKey>,
    pub unchanged: usize,
    pub failed: Vec<ObjectKey>,
}

async fn cancellable<T>(
    token: &CancellationToken,
    op: impl Future<Output = Result<T, StoreError>>,
) -> Result<Result<T, StoreError>, UpgradeError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(UpgradeError::Cancelled),
        r = op => Ok(r),
    }
}

/// Migrate every `Registry` (in `namespace`, or cluster-wide) and persist the
/// ones that changed. An instance that cannot be migrated gets a warning event
/// and is left alone; the rest carry on.
pub async fn upgrade_managed_instances<S, E>(
    store: &S,
    events: &E,
    chain: &MigrationChain,
    namespace: Option<&str>,
    token: &CancellationToken,
) -> Result<UpgradeSummary, UpgradeError>
where
    S: ObjectStore + ?Sized,
    E: EventSink + ?Sized,
{
    info!(target_version = %chain.target(), "looking for managed instances to upgrade");
    let items = cancellable(token, store.list_registries(namespace)).await?.map_err(UpgradeError::List)?;
    if items.is_empty() {
        info!("no instances to upgrade");
    }

    let mut summary = UpgradeSummary::default();
    for obj in items {
        let original: Registry = match from_dynamic(&obj) {
            Ok(r) => r,
            Err(e) => {
                warn!(name = ?obj.metadata.name, error = %e, "skipping undecodable registry");
                continue;
            }
        };
        let key = ObjectKey::registry(original.namespace(), original.name());

        let upgraded = match chain.migrate(original.clone()) {
            Ok(r) => r,
            Err(e) => {
                warn!(registry = %key, error = %e, "{UPGRADE_FAILED}");
                events.publish(&original.object_reference(), EventKind::Error, UPGRADE_FAILED.to_string()).await;
                summary.failed.push(key);
                continue;
            }
        };
        if upgraded == original {
            summary.unchanged += 1;
            continue;
        }

        if upgraded.spec != original.spec || upgraded.metadata != original.metadata {
            let obj = match to_dynamic(&upgraded) {
                Ok(o) => o,
                Err(e) => {
                    error!(registry = %key, error = %e, "failed to encode upgraded instance");
                    summary.failed.push(key);
                    continue;
                }
            };
            if let Err(e) = cancellable(token, store.update(&obj)).await? {
                error!(registry = %key, error = %e, "failed to apply changes to instance");
                summary.failed.push(key);
                continue;
            }
        }
        if upgraded.status != original.status {
            let status = match serde_json::to_value(&upgraded.status) {
                Ok(v) => v,
                Err(e) => {
                    error!(registry = %key, error = %e, "failed to encode instance status");
                    summary.failed.push(key);
                    continue;
                }
            };
            if let Err(e) = cancellable(token, store.patch_status(&key, &status)).await? {
                error!(registry = %key, error = %e, "failed to apply changes to instance's status");
                summary.failed.push(key);
                continue;
            }
        }
        info!(registry = %key, version = %upgraded.status.version, "instance upgraded");
        summary.upgraded.push(key);
    }
    Ok(summary)
}
