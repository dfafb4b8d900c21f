//! Names of the objects built for an instance. All of them are DNS-1123
//! labels of at most 63 characters.

pub const MAX_NAME: usize = 63;

/// File name of the distribution configuration inside the config volume.
pub const CONFIG_FILE: &str = "config.yaml";
pub const CONFIG_VOLUME: &str = "config";
pub const STORAGE_VOLUME: &str = "storage";
pub const CONTAINER: &str = "distribution";
pub const DISTRIBUTION_PORT: &str = "distribution";
pub const METRICS_PORT: &str = "metrics";

/// Hex digits of the config hash that always survive truncation.
const MIN_HASH_CHARS: usize = 16;

/// Lowercase, replace anything outside `[a-z0-9-.]` with `-`, and trim
/// non-alphanumerics from both ends.
pub fn dns_name(s: &str) -> String {
    let mapped: String = s
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    mapped.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}

/// `<base><suffix>`, cutting `base` so the result fits `max`.
fn with_suffix(base: &str, suffix: &str, max: usize) -> String {
    let keep = max.saturating_sub(suffix.len());
    let base: String = base.chars().take(keep).collect();
    format!("{base}{suffix}")
}

pub fn deployment(registry: &str) -> String {
    dns_name(&with_suffix(registry, "-registry", MAX_NAME))
}

pub fn service(registry: &str) -> String {
    dns_name(&with_suffix(registry, "-registry", MAX_NAME))
}

pub fn storage_claim(registry: &str) -> String {
    dns_name(&with_suffix(registry, "-registry-storage", MAX_NAME))
}

/// `<registry>-<hash>`. The name keeps at most `63 - 17` characters so at
/// least 16 hex digits of the hash remain.
pub fn config_secret(registry: &str, hash: &str) -> String {
    let base: String = registry.chars().take(MAX_NAME - 1 - MIN_HASH_CHARS).collect();
    let full = format!("{base}-{hash}");
    dns_name(&full.chars().take(MAX_NAME).collect::<String>())
}
