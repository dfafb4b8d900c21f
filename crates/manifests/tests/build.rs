#![forbid(unsafe_code)]

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::core::DynamicObject;
use registry_core::{
    from_dynamic, to_dynamic, PvcStorage, Registry, RegistrySpec, S3Storage, SecretKeySelector, Storage,
};
use registry_manifests::{build, selector_labels, BuildError, BuildParams};
use registry_store::MemoryStore;

const DEFAULT_IMAGE: &str = "docker.io/library/registry:3.0.0";

fn registry(storage: Option<Storage>) -> Registry {
    Registry::new("ns", "reg", RegistrySpec { storage, ..Default::default() }).with_defaults()
}

fn kinds(objs: &[DynamicObject]) -> Vec<String> {
    objs.iter().map(|o| o.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default()).collect()
}

fn params() -> BuildParams {
    BuildParams::new(DEFAULT_IMAGE)
}

#[tokio::test]
async fn empty_dir_instance_builds_secret_deployment_service() {
    let store = MemoryStore::new();
    let objs = build(&store, &registry(None), &params()).await.unwrap();
    assert_eq!(kinds(&objs), ["Secret", "Deployment", "Service"]);

    let secret: Secret = from_dynamic(&objs[0]).unwrap();
    let deploy: Deployment = from_dynamic(&objs[1]).unwrap();
    let secret_name = secret.metadata.name.clone().unwrap();
    assert!(secret_name.starts_with("reg-"));
    assert!(secret.data.unwrap().contains_key("config.yaml"));

    let spec = deploy.spec.unwrap();
    assert_eq!(deploy.metadata.name.as_deref(), Some("reg-registry"));
    assert_eq!(spec.replicas, Some(1));
    assert_eq!(spec.selector.match_labels, Some(selector_labels(&registry(None))));
    let pod = spec.template.spec.unwrap();
    let container = &pod.containers[0];
    assert_eq!(container.image.as_deref(), Some(DEFAULT_IMAGE));
    let ports: Vec<i32> = container.ports.clone().unwrap().iter().map(|p| p.container_port).collect();
    assert_eq!(ports, [5000, 5001]);
    let volumes = pod.volumes.unwrap();
    assert_eq!(volumes[0].secret.as_ref().unwrap().secret_name.as_deref(), Some(secret_name.as_str()));
    assert_eq!(
        volumes[1].empty_dir.as_ref().unwrap().size_limit,
        Some(Quantity("200Mi".into()))
    );
    let terms = pod.affinity.unwrap().node_affinity.unwrap().required_during_scheduling_ignored_during_execution.unwrap();
    assert_eq!(terms.node_selector_terms[0].match_expressions.as_ref().unwrap().len(), 2);
}

#[tokio::test]
async fn pvc_storage_adds_claim_before_deployment() {
    let store = MemoryStore::new();
    let storage = Storage::PersistentVolumeClaim(PvcStorage {
        storage_class_name: Some("fast".into()),
        size: Quantity("10Gi".into()),
        access_modes: vec![],
    });
    let objs = build(&store, &registry(Some(storage)), &params()).await.unwrap();
    assert_eq!(kinds(&objs), ["Secret", "PersistentVolumeClaim", "Deployment", "Service"]);

    let pvc: PersistentVolumeClaim = from_dynamic(&objs[1]).unwrap();
    assert_eq!(pvc.metadata.name.as_deref(), Some("reg-registry-storage"));
    let spec = pvc.spec.unwrap();
    assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
    assert_eq!(spec.resources.unwrap().requests.unwrap()["storage"], Quantity("10Gi".into()));

    let deploy: Deployment = from_dynamic(&objs[2]).unwrap();
    let volumes = deploy.spec.unwrap().template.spec.unwrap().volumes.unwrap();
    assert_eq!(
        volumes[1].persistent_volume_claim.as_ref().map(|c| c.claim_name.as_str()),
        Some("reg-registry-storage")
    );
}

#[tokio::test]
async fn service_selects_pods_by_selector_labels() {
    let store = MemoryStore::new();
    let r = registry(None);
    let objs = build(&store, &r, &params()).await.unwrap();
    let svc: Service = from_dynamic(&objs[2]).unwrap();
    let spec = svc.spec.unwrap();
    assert_eq!(spec.selector, Some(selector_labels(&r)));
    assert_eq!(spec.ports.unwrap()[0].port, 5000);
    assert_eq!(
        svc.metadata.labels.unwrap()["registry.registry-operator.dev/registry-service-type"],
        "base"
    );
}

#[tokio::test]
async fn storage_change_renames_config_secret() {
    let store = MemoryStore::new();
    let fs = build(&store, &registry(None), &params()).await.unwrap();
    let again = build(&store, &registry(None), &params()).await.unwrap();
    assert_eq!(fs[0].metadata.name, again[0].metadata.name);

    let s3_store = MemoryStore::new();
    seed_s3_secret(&s3_store, "http://minio:9000");
    let s3 = build(&s3_store, &registry(Some(s3_storage())), &params()).await.unwrap();
    assert_ne!(fs[0].metadata.name, s3[0].metadata.name);
}

fn s3_storage() -> Storage {
    let sel = |key: &str| SecretKeySelector { name: "s3".into(), key: key.into() };
    Storage::S3(S3Storage {
        bucket_name: sel("bucket"),
        region: sel("region"),
        access_key: Some(sel("access")),
        secret_key: Some(sel("secret")),
        endpoint_url: Some(sel("endpoint")),
    })
}

fn seed_s3_secret(store: &MemoryStore, endpoint: &str) {
    let secret = Secret {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some("s3".into()),
            namespace: Some("ns".into()),
            ..Default::default()
        },
        data: Some(
            [("bucket", "images"), ("region", "eu-1"), ("access", "AK"), ("secret", "SK"), ("endpoint", endpoint)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), k8s_openapi::ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    };
    store.insert(to_dynamic(&secret).unwrap()).unwrap();
}

#[tokio::test]
async fn s3_storage_reads_credentials_and_drops_local_volume() {
    let store = MemoryStore::new();
    seed_s3_secret(&store, "http://minio:9000");
    let objs = build(&store, &registry(Some(s3_storage())), &params()).await.unwrap();
    assert_eq!(kinds(&objs), ["Secret", "Deployment", "Service"]);

    let secret: Secret = from_dynamic(&objs[0]).unwrap();
    let yaml = String::from_utf8(secret.data.unwrap()["config.yaml"].0.clone()).unwrap();
    let cfg: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
    let s3 = &cfg["storage"]["s3"];
    assert_eq!(s3["bucket"], serde_yaml::Value::from("images"));
    assert_eq!(s3["regionendpoint"], serde_yaml::Value::from("http://minio:9000"));
    assert_eq!(s3["secure"], serde_yaml::Value::Bool(false));
    assert_eq!(s3["rootdirectory"], serde_yaml::Value::from("/registry"));

    let deploy: Deployment = from_dynamic(&objs[1]).unwrap();
    let pod = deploy.spec.unwrap().template.spec.unwrap();
    assert_eq!(pod.volumes.unwrap().len(), 1);
    assert_eq!(pod.containers[0].volume_mounts.as_ref().unwrap().len(), 1);
}

#[tokio::test]
async fn missing_s3_secret_reports_every_reference() {
    let store = MemoryStore::new();
    let err = build(&store, &registry(Some(s3_storage())), &params()).await.unwrap_err();
    match err {
        BuildError::Secrets(msg) => {
            assert!(msg.contains("failed to fetch secret ns/s3"));
            assert_eq!(msg.matches("failed to fetch secret").count(), 5);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn filtered_labels_are_not_propagated() {
    let store = MemoryStore::new();
    let mut r = registry(None);
    r.metadata.labels = Some([("team".to_string(), "a".to_string()), ("ci.example.com/run".to_string(), "7".to_string())].into());
    let params = params().with_filters(&[r"^ci\.example\.com/"], &[] as &[&str]).unwrap();
    let objs = build(&store, &r, &params).await.unwrap();
    let labels = objs[1].metadata.labels.clone().unwrap();
    assert_eq!(labels["team"], "a");
    assert!(!labels.contains_key("ci.example.com/run"));
}
