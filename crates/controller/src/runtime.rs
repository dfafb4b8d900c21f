//! kube runtime wiring: watch registries, everything they own and the S3
//! Secrets they read, run a pass per change.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::Api;
use kube::core::GroupVersionKind;
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Client, Resource};
use registry_apply::{Converger, MergeRuleTable, RetryPolicy};
use registry_core::{registry, ObjectKind, Registry};
use registry_kubehub::{find_api_resource, KubeEventSink, KubeStore};
use registry_manifests::BuildParams;
use registry_upgrade::{upgrade_managed_instances, MigrationChain};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::watches::{map_secret, SecretChanges};
use crate::{retry_delay, ReconcileError, Reconciler};

/// Settings for [`run`], collected once from the command line.
pub struct RunConfig {
    /// Watch a single namespace instead of the whole cluster.
    pub namespace: Option<String>,
    pub requeue: Duration,
    pub retry: RetryPolicy,
    pub params: BuildParams,
    pub chain: MigrationChain,
}

struct Ctx {
    reconciler: Reconciler<KubeStore, KubeEventSink>,
    requeue: Duration,
    token: CancellationToken,
}

async fn reconcile(obj: Arc<Registry>, ctx: Arc<Ctx>) -> Result<Action, ReconcileError> {
    let token = ctx.token.child_token();
    ctx.reconciler.reconcile(obj.namespace(), obj.name(), &token).await?;
    Ok(Action::await_change())
}

fn error_policy(obj: Arc<Registry>, err: &ReconcileError, ctx: Arc<Ctx>) -> Action {
    match retry_delay(err, ctx.requeue) {
        Some(delay) => {
            debug!(registry = %obj.name(), error = %err, delay_secs = delay.as_secs(), "requeue");
            Action::requeue(delay)
        }
        None => Action::await_change(),
    }
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Upgrade stored instances once, then run the controller until a shutdown
/// signal arrives.
pub async fn run(client: Client, config: RunConfig) -> anyhow::Result<()> {
    let gvk = GroupVersionKind::gvk(registry::GROUP, registry::VERSION, registry::KIND);
    find_api_resource(client.clone(), &gvk)
        .await
        .context("the Registry custom resource definition is not installed")?;

    let rules = MergeRuleTable::standard();
    rules.ensure_complete(&ObjectKind::ALL)?;
    let converger = Converger::new(rules, config.retry);

    let store = KubeStore::new(client.clone());
    let events = KubeEventSink::new(client.clone());
    let token = CancellationToken::new();
    let ns = config.namespace.as_deref();

    let summary = upgrade_managed_instances(&store, &events, &config.chain, ns, &token).await?;
    info!(
        upgraded = summary.upgraded.len(),
        failed = summary.failed.len(),
        unchanged = summary.unchanged,
        "startup upgrade finished"
    );

    let ctx = Arc::new(Ctx {
        reconciler: Reconciler::new(store, events, config.chain, config.params, converger),
        requeue: config.requeue,
        token: token.clone(),
    });
    let wc = watcher::Config::default();
    info!(namespace = ns.unwrap_or("(all)"), "controller starting");
    let controller = Controller::new(scoped::<Registry>(&client, ns), wc.clone());
    let registries = controller.store();
    let changes = SecretChanges::default();
    controller
        .owns(scoped::<Deployment>(&client, ns), wc.clone())
        .owns(scoped::<Service>(&client, ns), wc.clone())
        .owns(scoped::<Secret>(&client, ns), wc.clone())
        .owns(scoped::<ConfigMap>(&client, ns), wc.clone())
        .owns(scoped::<PersistentVolumeClaim>(&client, ns), wc.clone())
        .watches(scoped::<Secret>(&client, ns), wc, move |secret: Secret| {
            map_secret(&secret, &registries.state(), &changes)
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(registry = %obj, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile failed"),
            }
        })
        .await;
    token.cancel();
    info!("controller stopped");
    Ok(())
}
