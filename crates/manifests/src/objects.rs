//! Typed builders for the objects of one instance.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, KeyToPath, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
    PodSpec, PodTemplateSpec, Secret, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use registry_core::{PvcStorage, Registry, Storage};

use crate::labels::{annotations, labels, selector_labels};
use crate::naming;
use crate::BuildParams;

pub const DISTRIBUTION_PORT: i32 = 5000;
pub const METRICS_PORT: i32 = 5001;
pub const CONFIG_MOUNT_PATH: &str = "/etc/distribution";
pub const STORAGE_MOUNT_PATH: &str = "/var/lib/registry";
pub const SERVICE_TYPE_LABEL: &str = "registry.registry-operator.dev/registry-service-type";

const LABEL_OS: &str = "kubernetes.io/os";
const LABEL_ARCH: &str = "kubernetes.io/arch";

fn meta(registry: &Registry, name: &str, labels: BTreeMap<String, String>, params: &BuildParams) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(registry.namespace().to_string()),
        labels: Some(labels),
        annotations: Some(annotations(registry, &params.annotation_filters)),
        ..Default::default()
    }
}

/// Image from the spec, or the default shipped with the operator.
pub fn image(registry: &Registry, params: &BuildParams) -> String {
    if registry.spec.image.is_empty() {
        params.default_image.clone()
    } else {
        registry.spec.image.clone()
    }
}

/// The spec's affinity, or linux nodes on the architectures the registry
/// image is published for.
pub fn affinity(registry: &Registry) -> Affinity {
    if let Some(a) = &registry.spec.affinity {
        return a.clone();
    }
    let requirement = |key: &str, values: &[&str]| NodeSelectorRequirement {
        key: key.to_string(),
        operator: "In".to_string(),
        values: Some(values.iter().map(|v| v.to_string()).collect()),
    };
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![
                        requirement(LABEL_ARCH, &["amd64", "arm64", "ppc64le", "s390x"]),
                        requirement(LABEL_OS, &["linux"]),
                    ]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container_ports() -> Vec<ContainerPort> {
    vec![
        ContainerPort {
            name: Some(naming::DISTRIBUTION_PORT.to_string()),
            protocol: Some("TCP".to_string()),
            container_port: DISTRIBUTION_PORT,
            ..Default::default()
        },
        ContainerPort {
            name: Some(naming::METRICS_PORT.to_string()),
            protocol: Some("TCP".to_string()),
            container_port: METRICS_PORT,
            ..Default::default()
        },
    ]
}

fn uses_local_storage(registry: &Registry) -> bool {
    !matches!(registry.spec.storage, Some(Storage::S3(_)))
}

pub fn container(registry: &Registry, params: &BuildParams) -> Container {
    let mut mounts = vec![VolumeMount {
        name: naming::CONFIG_VOLUME.to_string(),
        read_only: Some(true),
        mount_path: CONFIG_MOUNT_PATH.to_string(),
        ..Default::default()
    }];
    if uses_local_storage(registry) {
        mounts.push(VolumeMount {
            name: naming::STORAGE_VOLUME.to_string(),
            read_only: Some(false),
            mount_path: STORAGE_MOUNT_PATH.to_string(),
            ..Default::default()
        });
    }
    Container {
        name: naming::CONTAINER.to_string(),
        image: Some(image(registry, params)),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["registry".to_string()]),
        args: Some(vec!["serve".to_string(), format!("{CONFIG_MOUNT_PATH}/{}", naming::CONFIG_FILE)]),
        ports: Some(container_ports()),
        volume_mounts: Some(mounts),
        resources: Some(registry.spec.resources.clone().unwrap_or_default()),
        ..Default::default()
    }
}

fn volumes(registry: &Registry, secret_name: &str) -> Vec<Volume> {
    let mut out = vec![Volume {
        name: naming::CONFIG_VOLUME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            items: Some(vec![KeyToPath {
                key: naming::CONFIG_FILE.to_string(),
                path: naming::CONFIG_FILE.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }];
    match &registry.spec.storage {
        Some(Storage::EmptyDir(ed)) => out.push(Volume {
            name: naming::STORAGE_VOLUME.to_string(),
            empty_dir: Some(ed.clone()),
            ..Default::default()
        }),
        Some(Storage::PersistentVolumeClaim(_)) => out.push(Volume {
            name: naming::STORAGE_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: naming::storage_claim(registry.name()),
                read_only: Some(false),
            }),
            ..Default::default()
        }),
        Some(Storage::S3(_)) => {}
        None => out.push(Volume {
            name: naming::STORAGE_VOLUME.to_string(),
            empty_dir: Some(Default::default()),
            ..Default::default()
        }),
    }
    out
}

/// Configuration Secret; `data` rather than `stringData` so the stored object
/// reads back exactly as built.
pub fn config_secret(registry: &Registry, params: &BuildParams, name: &str, yaml: &str) -> Secret {
    let img = image(registry, params);
    Secret {
        metadata: meta(registry, name, labels(registry, name, &img, &params.label_filters), params),
        data: Some(BTreeMap::from([(naming::CONFIG_FILE.to_string(), ByteString(yaml.as_bytes().to_vec()))])),
        ..Default::default()
    }
}

pub fn storage_claim(registry: &Registry, params: &BuildParams, pvc: &PvcStorage) -> PersistentVolumeClaim {
    let name = naming::storage_claim(registry.name());
    let img = image(registry, params);
    let access_modes = if pvc.access_modes.is_empty() {
        vec!["ReadWriteOnce".to_string()]
    } else {
        pvc.access_modes.clone()
    };
    PersistentVolumeClaim {
        metadata: meta(registry, &name, labels(registry, &name, &img, &params.label_filters), params),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(access_modes),
            storage_class_name: pvc.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), pvc.size.clone())])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn deployment(registry: &Registry, params: &BuildParams, secret_name: &str) -> Deployment {
    let name = naming::deployment(registry.name());
    let img = image(registry, params);
    let labels = labels(registry, &name, &img, &params.label_filters);
    Deployment {
        metadata: meta(registry, &name, labels.clone(), params),
        spec: Some(DeploymentSpec {
            replicas: Some(registry.replicas()),
            selector: LabelSelector { match_labels: Some(selector_labels(registry)), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations(registry, &params.annotation_filters)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    affinity: Some(affinity(registry)),
                    containers: vec![container(registry, params)],
                    volumes: Some(volumes(registry, secret_name)),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn service(registry: &Registry, params: &BuildParams) -> Service {
    let name = naming::service(registry.name());
    let img = image(registry, params);
    let mut labels = labels(registry, &name, &img, &params.label_filters);
    labels.insert(SERVICE_TYPE_LABEL.to_string(), "base".to_string());
    let ports = container_ports()
        .into_iter()
        .map(|cp| ServicePort {
            target_port: Some(match &cp.name {
                Some(n) => IntOrString::String(n.clone()),
                None => IntOrString::Int(cp.container_port),
            }),
            name: cp.name,
            protocol: cp.protocol,
            port: cp.container_port,
            ..Default::default()
        })
        .collect();
    Service {
        metadata: meta(registry, &name, labels, params),
        spec: Some(ServiceSpec {
            internal_traffic_policy: Some("Cluster".to_string()),
            selector: Some(selector_labels(registry)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}
