//! Versions baked into the operator binary.

use serde::{Deserialize, Serialize};

const VALUES: &str = include_str!("../values.yaml");

/// Fallback registry version when the embedded values carry no tag.
pub const FALLBACK_VERSION: &str = "0.0.0";

#[derive(Debug, Default, Deserialize)]
struct Values {
    #[serde(default)]
    registry: RegistryValues,
}

#[derive(Debug, Default, Deserialize)]
struct RegistryValues {
    #[serde(default)]
    image: ImageValues,
}

#[derive(Debug, Default, Deserialize)]
struct ImageValues {
    #[serde(default)]
    repository: String,
    #[serde(default)]
    tag: String,
}

/// Operator and registry versions, read once at startup and passed around by
/// reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "registry-operator")]
    pub operator: String,
    #[serde(rename = "build-date")]
    pub build_date: String,
    pub registry: String,
    /// Image used for instances that leave `spec.image` empty.
    #[serde(rename = "registry-image")]
    pub image: String,
}

impl VersionInfo {
    /// Version info from the embedded `values.yaml`.
    pub fn embedded() -> Result<Self, serde_yaml::Error> {
        Self::from_values(VALUES)
    }

    pub fn from_values(raw: &str) -> Result<Self, serde_yaml::Error> {
        let values: Values = serde_yaml::from_str(raw)?;
        let ImageValues { repository, tag } = values.registry.image;
        let registry = if tag.is_empty() { FALLBACK_VERSION.to_string() } else { tag.clone() };
        let image = match (repository.is_empty(), tag.is_empty()) {
            (false, false) => format!("{repository}:{tag}"),
            (false, true) => repository,
            _ => String::new(),
        };
        Ok(Self {
            operator: env!("CARGO_PKG_VERSION").to_string(),
            build_date: option_env!("REGISTRY_BUILD_DATE").unwrap_or_default().to_string(),
            registry,
            image,
        })
    }
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "registry-operator {} (build date {:?}), registry {} ({})",
            self.operator, self.build_date, self.registry, self.image
        )
    }
}
