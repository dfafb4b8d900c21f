//! Labels and annotations stamped on every built object.

use std::collections::BTreeMap;

use regex::Regex;
use registry_core::Registry;

use crate::naming::MAX_NAME;
use crate::BuildError;

pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const INSTANCE: &str = "app.kubernetes.io/instance";
pub const PART_OF: &str = "app.kubernetes.io/part-of";
pub const COMPONENT: &str = "app.kubernetes.io/component";
pub const VERSION: &str = "app.kubernetes.io/version";
pub const NAME: &str = "app.kubernetes.io/name";

pub const OPERATOR: &str = "registry-operator";
pub const COMPONENT_REGISTRY: &str = "registry";

/// Keys matching any of these patterns are not copied from the instance.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    patterns: Vec<Regex>,
}

impl Filters {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, BuildError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|source| BuildError::Filter { pattern: p.as_ref().to_string(), source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_filtered(&self, key: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(key))
    }

    fn copy(&self, src: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
        src.into_iter()
            .flatten()
            .filter(|(k, _)| !self.is_filtered(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// The immutable label set that identifies everything an instance owns.
pub fn selector_labels(registry: &Registry) -> BTreeMap<String, String> {
    let instance: String = format!("{}.{}", registry.namespace(), registry.name()).chars().take(MAX_NAME).collect();
    BTreeMap::from([
        (MANAGED_BY.to_string(), OPERATOR.to_string()),
        (INSTANCE.to_string(), instance),
        (PART_OF.to_string(), "registry".to_string()),
        (COMPONENT.to_string(), COMPONENT_REGISTRY.to_string()),
    ])
}

/// Version label value derived from an image reference: the tag, the tag of
/// a `tag@sha256:` reference, the digest when there is no tag, or `latest`.
pub fn image_version(image: &str) -> String {
    let parts: Vec<&str> = image.split(':').collect();
    let tagged_digest = parts.iter().find_map(|p| p.strip_suffix("@sha256"));
    match parts.len() {
        3 => tagged_digest.unwrap_or(parts[2]).to_string(),
        2 => parts[1].chars().take(MAX_NAME).collect(),
        _ => "latest".to_string(),
    }
}

/// Instance labels (minus filtered keys), the selector labels, the version
/// label, and `app.kubernetes.io/name` unless the instance already sets it.
pub fn labels(registry: &Registry, name: &str, image: &str, filters: &Filters) -> BTreeMap<String, String> {
    let mut out = filters.copy(registry.metadata.labels.as_ref());
    out.extend(selector_labels(registry));
    out.insert(VERSION.to_string(), image_version(image));
    out.entry(NAME.to_string()).or_insert_with(|| name.to_string());
    out
}

pub fn annotations(registry: &Registry, filters: &Filters) -> BTreeMap<String, String> {
    filters.copy(registry.metadata.annotations.as_ref())
}
