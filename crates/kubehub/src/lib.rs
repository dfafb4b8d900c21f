//! Registry kubehub: kube-rs backed object store and event recorder.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions, PropagationPolicy},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client,
};
use metrics::counter;
use registry_core::{EventKind, EventSink, ObjectKey, ObjectKind, Registry};
use registry_store::{ObjectStore, Selector, StoreError};
use tracing::{debug, warn};

/// Controller name used as event reporter and field manager.
pub const MANAGER: &str = "registry-operator";

pub async fn get_kube_client() -> Result<Client> {
    Ok(Client::try_default().await?)
}

/// Resolve an `apiVersion`/`kind` pair through API discovery.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn gvk_of(key: &ObjectKey) -> GroupVersionKind {
    let (group, version) = match key.api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), key.api_version.clone()),
    };
    GroupVersionKind { group, version, kind: key.kind.clone() }
}

/// Label selector in `k=v,k2=v2` form.
pub fn selector_string(selector: &Selector) -> String {
    selector.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
}

fn store_error(key: &ObjectKey, err: kube::Error) -> StoreError {
    counter!("kube_store_errors", 1u64);
    match err {
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => StoreError::AlreadyExists(key.clone()),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict { key: key.clone(), reason: ae.message },
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(key.clone()),
        other => StoreError::Api(format!("{key}: {other}")),
    }
}

/// [`ObjectStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn api_for(&self, key: &ObjectKey) -> Result<Api<DynamicObject>, StoreError> {
        let ar = if let Some(kind) = key.object_kind() {
            kind.api_resource()
        } else if key.is_registry() {
            ApiResource::erase::<Registry>(&())
        } else {
            let (ar, namespaced) = find_api_resource(self.client.clone(), &gvk_of(key))
                .await
                .map_err(|e| StoreError::Api(e.to_string()))?;
            if !namespaced {
                return Ok(Api::all_with(self.client.clone(), &ar));
            }
            ar
        };
        Ok(match &key.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        })
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        let api = self.api_for(key).await?;
        counter!("kube_store_requests", 1u64, "verb" => "get");
        api.get_opt(&key.name).await.map_err(|e| store_error(key, e))
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>, StoreError> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource());
        let lp = ListParams::default().labels(&selector_string(selector));
        counter!("kube_store_requests", 1u64, "verb" => "list");
        let list = api.list(&lp).await.map_err(|e| StoreError::Api(format!("list {kind} in {namespace}: {e}")))?;
        debug!(kind = %kind, ns = %namespace, count = list.items.len(), "listed");
        Ok(list.items.into_iter().map(|o| with_types(o, kind.api_version(), kind.kind())).collect())
    }

    async fn list_registries(&self, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        let ar = ApiResource::erase::<Registry>(&());
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        counter!("kube_store_requests", 1u64, "verb" => "list");
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| StoreError::Api(format!("list registries: {e}")))?;
        Ok(list.items.into_iter().map(|o| with_types(o, &ar.api_version, &ar.kind)).collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::of(obj)?;
        let api = self.api_for(&key).await?;
        counter!("kube_store_requests", 1u64, "verb" => "create");
        let pp = PostParams { field_manager: Some(MANAGER.to_string()), ..Default::default() };
        api.create(&pp, obj).await.map_err(|e| store_error(&key, e))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::of(obj)?;
        let api = self.api_for(&key).await?;
        counter!("kube_store_requests", 1u64, "verb" => "update");
        let pp = PostParams { field_manager: Some(MANAGER.to_string()), ..Default::default() };
        api.replace(&key.name, &pp, obj).await.map_err(|e| store_error(&key, e))
    }

    async fn delete(&self, obj: &DynamicObject) -> Result<(), StoreError> {
        let key = ObjectKey::of(obj)?;
        let api = self.api_for(&key).await?;
        counter!("kube_store_requests", 1u64, "verb" => "delete");
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            preconditions: Some(Preconditions { uid: obj.metadata.uid.clone(), resource_version: None }),
            ..Default::default()
        };
        api.delete(&key.name, &dp).await.map_err(|e| store_error(&key, e))?;
        Ok(())
    }

    async fn patch_status(&self, key: &ObjectKey, status: &serde_json::Value) -> Result<DynamicObject, StoreError> {
        let api = self.api_for(key).await?;
        counter!("kube_store_requests", 1u64, "verb" => "patch_status");
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| store_error(key, e))
    }
}

// List responses omit per-item apiVersion/kind.
fn with_types(mut obj: DynamicObject, api_version: &str, kind: &str) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(kube::core::TypeMeta { api_version: api_version.to_string(), kind: kind.to_string() });
    }
    obj
}

/// [`EventSink`] publishing Kubernetes events through the kube recorder.
#[derive(Clone)]
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client) -> Self {
        let instance = std::env::var("POD_NAME").ok();
        Self { client, reporter: Reporter { controller: MANAGER.to_string(), instance } }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, regarding: &ObjectReference, kind: EventKind, message: String) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), regarding.clone());
        let type_ = if kind.is_warning() { EventType::Warning } else { EventType::Normal };
        let ev = Event {
            type_,
            reason: kind.reason().to_string(),
            note: Some(message),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(ev).await {
            counter!("kube_event_errors", 1u64);
            warn!(error = %e, object = ?regarding.name, "publishing event failed");
        }
    }
}
