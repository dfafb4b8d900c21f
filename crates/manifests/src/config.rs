//! Distribution (`registry serve`) configuration file.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use registry_core::{from_dynamic, ObjectKey, ObjectKind, Registry, S3Storage, SecretKeySelector, Storage};
use registry_store::ObjectStore;
use serde::Serialize;
use serde_yaml::Value as Yaml;
use sha2::{Digest, Sha256};

use crate::BuildError;

pub const FILESYSTEM_ROOT: &str = "/var/lib/registry";
pub const S3_ROOT: &str = "/registry";

pub type Parameters = BTreeMap<String, Yaml>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionConfig {
    pub version: String,
    pub log: LogConfig,
    pub storage: BTreeMap<String, Parameters>,
    pub http: HttpConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogConfig {
    pub level: String,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpConfig {
    pub addr: String,
    pub debug: DebugConfig,
    pub headers: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugConfig {
    pub addr: String,
    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrometheusConfig {
    pub enabled: bool,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthConfig {
    pub storagedriver: StorageDriverHealth,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageDriverHealth {
    pub enabled: bool,
    pub interval: String,
    pub threshold: u32,
}

fn params<const N: usize>(pairs: [(&str, Yaml); N]) -> Parameters {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

impl DistributionConfig {
    /// Configuration for the given storage parameters; `s3` selects the S3
    /// driver, anything else the filesystem driver.
    pub fn new(s3: Option<Parameters>) -> Self {
        let mut storage = BTreeMap::from([
            ("delete".to_string(), params([("enabled", Yaml::Bool(true))])),
            ("cache".to_string(), params([("blobdescriptor", Yaml::from("inmemory"))])),
            (
                "maintenance".to_string(),
                params([("uploadpurging", Yaml::Mapping([(Yaml::from("enabled"), Yaml::Bool(false))].into_iter().collect()))]),
            ),
            ("tag".to_string(), params([("concurrencylimit", Yaml::from(8))])),
        ]);
        match s3 {
            Some(s3) => {
                let mut driver = params([("rootdirectory", Yaml::from(S3_ROOT))]);
                driver.extend(s3);
                storage.insert("s3".to_string(), driver);
            }
            None => {
                storage.insert("filesystem".to_string(), params([("rootdirectory", Yaml::from(FILESYSTEM_ROOT))]));
            }
        }
        Self {
            version: "0.1".to_string(),
            log: LogConfig {
                level: "debug".to_string(),
                fields: BTreeMap::from([
                    ("service".to_string(), "registry".to_string()),
                    ("environment".to_string(), "development".to_string()),
                ]),
            },
            storage,
            http: HttpConfig {
                addr: ":5000".to_string(),
                debug: DebugConfig {
                    addr: ":5001".to_string(),
                    prometheus: PrometheusConfig { enabled: true, path: "/metrics".to_string() },
                },
                headers: BTreeMap::from([("X-Content-Type-Options".to_string(), vec!["nosniff".to_string()])]),
            },
            health: HealthConfig {
                storagedriver: StorageDriverHealth { enabled: true, interval: "10s".to_string(), threshold: 3 },
            },
        }
    }

    pub fn to_yaml(&self) -> Result<String, BuildError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Lowercase hex SHA-256 of the rendered configuration.
pub fn content_hash(yaml: &str) -> String {
    hex::encode(Sha256::digest(yaml.as_bytes()))
}

async fn secret_value<S>(store: &S, namespace: &str, sel: &SecretKeySelector) -> Result<String, String>
where
    S: ObjectStore + ?Sized,
{
    let key = ObjectKey::new(ObjectKind::Secret, namespace, &sel.name);
    let obj = store
        .get(&key)
        .await
        .map_err(|e| format!("failed to fetch secret {namespace}/{}: {e}", sel.name))?
        .ok_or_else(|| format!("failed to fetch secret {namespace}/{}: not found", sel.name))?;
    let secret: Secret = from_dynamic(&obj).map_err(|e| format!("decoding secret {namespace}/{}: {e}", sel.name))?;
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(&sel.key))
        .ok_or_else(|| format!("value for {} not found in {namespace}/{}", sel.key, sel.name))?;
    String::from_utf8(bytes.0.clone()).map_err(|_| format!("value for {} in {namespace}/{} is not UTF-8", sel.key, sel.name))
}

/// Endpoint without a scheme gets `https://`; a plain `http` endpoint turns
/// TLS off for the driver. Returns the endpoint and whether it is secure.
pub fn normalize_endpoint(endpoint: &str) -> Result<(String, bool), BuildError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() || endpoint.contains(char::is_whitespace) {
        return Err(BuildError::Endpoint(endpoint.to_string()));
    }
    match endpoint.split_once("://") {
        None => Ok((format!("https://{endpoint}"), true)),
        Some(("http", _)) => Ok((endpoint.to_string(), false)),
        Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => Ok((endpoint.to_string(), true)),
        Some(_) => Err(BuildError::Endpoint(endpoint.to_string())),
    }
}

/// Resolve the S3 driver parameters from Secrets in the instance namespace.
/// Every unreadable reference is reported, not just the first.
pub async fn s3_parameters<S>(store: &S, namespace: &str, s3: &S3Storage) -> Result<Parameters, BuildError>
where
    S: ObjectStore + ?Sized,
{
    let mut out = Parameters::new();
    let mut errors = Vec::new();
    let refs = [
        ("bucket", Some(&s3.bucket_name)),
        ("region", Some(&s3.region)),
        ("accesskey", s3.access_key.as_ref()),
        ("secretkey", s3.secret_key.as_ref()),
    ];
    for (param, sel) in refs {
        let Some(sel) = sel else { continue };
        match secret_value(store, namespace, sel).await {
            Ok(v) => {
                out.insert(param.to_string(), Yaml::from(v));
            }
            Err(e) => errors.push(e),
        }
    }
    if let Some(sel) = &s3.endpoint_url {
        match secret_value(store, namespace, sel).await {
            Ok(raw) => {
                let (endpoint, secure) = normalize_endpoint(&raw)?;
                if !secure {
                    out.insert("secure".to_string(), Yaml::Bool(false));
                }
                out.insert("regionendpoint".to_string(), Yaml::from(endpoint));
            }
            Err(e) => errors.push(e),
        }
    }
    if !errors.is_empty() {
        return Err(BuildError::Secrets(errors.join("; ")));
    }
    Ok(out)
}

/// Render the configuration for `registry`, reading S3 credentials when S3
/// storage is selected.
pub async fn render<S>(store: &S, registry: &Registry) -> Result<DistributionConfig, BuildError>
where
    S: ObjectStore + ?Sized,
{
    let s3 = match &registry.spec.storage {
        Some(Storage::S3(s3)) => Some(s3_parameters(store, registry.namespace(), s3).await?),
        _ => None,
    };
    Ok(DistributionConfig::new(s3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_config_renders_stable_yaml() {
        let cfg = DistributionConfig::new(None);
        let yaml = cfg.to_yaml().unwrap();
        assert!(yaml.contains("rootdirectory: /var/lib/registry"));
        let back: Yaml = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back["http"]["addr"], Yaml::from(":5000"));
        assert_eq!(back["storage"]["tag"]["concurrencylimit"], Yaml::from(8));
        assert_eq!(content_hash(&yaml), content_hash(&DistributionConfig::new(None).to_yaml().unwrap()));
        assert_eq!(content_hash(&yaml).len(), 64);
    }

    #[test]
    fn s3_config_replaces_filesystem_driver() {
        let cfg = DistributionConfig::new(Some(params([("bucket", Yaml::from("b"))])));
        assert!(cfg.storage.contains_key("s3"));
        assert!(!cfg.storage.contains_key("filesystem"));
        assert_eq!(cfg.storage["s3"]["rootdirectory"], Yaml::from(S3_ROOT));
        assert_eq!(cfg.storage["s3"]["bucket"], Yaml::from("b"));
    }

    #[test]
    fn endpoints_are_normalized() {
        assert_eq!(normalize_endpoint("minio.local:9000").unwrap(), ("https://minio.local:9000".to_string(), true));
        assert_eq!(normalize_endpoint("http://minio:9000").unwrap(), ("http://minio:9000".to_string(), false));
        assert_eq!(normalize_endpoint("https://s3.example").unwrap(), ("https://s3.example".to_string(), true));
        assert!(normalize_endpoint("://nohost").is_err());
        assert!(normalize_endpoint("").is_err());
    }
}
