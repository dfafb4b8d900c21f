//! Kind-specific merge rules.
//!
//! A rule copies the fields the operator owns from the desired object into
//! the stored one and leaves everything else (server defaults, fields other
//! controllers manage) alone. Rules work on the JSON body of a
//! `DynamicObject`; metadata is merged separately by [`merge_metadata`].

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use registry_core::ObjectKind;
use serde_json::{Map, Value as Json};

use crate::ApplyError;

/// Labels and annotations: existing keys survive, desired keys win.
/// Owner references are replaced wholesale when desired carries any.
pub fn merge_metadata(existing: &mut ObjectMeta, desired: &ObjectMeta) {
    merge_string_map(&mut existing.labels, desired.labels.as_ref());
    merge_string_map(&mut existing.annotations, desired.annotations.as_ref());
    if let Some(refs) = desired.owner_references.as_ref().filter(|r| !r.is_empty()) {
        existing.owner_references = Some(refs.clone());
    }
}

fn merge_string_map(dst: &mut Option<BTreeMap<String, String>>, src: Option<&BTreeMap<String, String>>) {
    let Some(src) = src.filter(|m| !m.is_empty()) else { return };
    let dst = dst.get_or_insert_with(BTreeMap::new);
    for (k, v) in src {
        dst.insert(k.clone(), v.clone());
    }
}

pub trait MergeRule: Send + Sync {
    fn kind(&self) -> ObjectKind;

    /// Merge `desired` into `existing`. `exists` is false when `existing` is
    /// the desired template itself, about to be created.
    fn merge(&self, existing: &mut Json, desired: &Json, exists: bool) -> Result<(), ApplyError>;
}

fn get_path<'a>(v: &'a Json, path: &[&str]) -> Option<&'a Json> {
    path.iter().try_fold(v, |cur, seg| cur.get(*seg)).filter(|v| !v.is_null())
}

fn parent_mut<'a>(v: &'a mut Json, path: &[&str]) -> Result<&'a mut Map<String, Json>, ApplyError> {
    let mut cur = v;
    for seg in path {
        if cur.is_null() {
            *cur = Json::Object(Map::new());
        }
        let map = cur
            .as_object_mut()
            .ok_or_else(|| ApplyError::InvalidObject(format!("{} is not an object", path.join("."))))?;
        cur = map.entry(seg.to_string()).or_insert(Json::Null);
    }
    if cur.is_null() {
        *cur = Json::Object(Map::new());
    }
    cur.as_object_mut()
        .ok_or_else(|| ApplyError::InvalidObject(format!("{} is not an object", path.join("."))))
}

/// Make `existing[path]` equal `desired[path]`, removing it when desired has
/// no value there.
pub(crate) fn copy_field(existing: &mut Json, desired: &Json, path: &[&str]) -> Result<(), ApplyError> {
    let Some((last, parents)) = path.split_last() else { return Ok(()) };
    match get_path(desired, path) {
        Some(value) => {
            parent_mut(existing, parents)?.insert(last.to_string(), value.clone());
        }
        None => {
            if let Some(Json::Object(map)) = parents.iter().try_fold(&mut *existing, |cur, seg| cur.get_mut(*seg)) {
                map.remove(*last);
            }
        }
    }
    Ok(())
}

fn merge_json_map(existing: &mut Json, desired: &Json, path: &[&str]) -> Result<(), ApplyError> {
    let Some(Json::Object(src)) = get_path(desired, path) else { return Ok(()) };
    let Some((last, parents)) = path.split_last() else { return Ok(()) };
    let parent = parent_mut(existing, parents)?;
    let slot = parent.entry(last.to_string()).or_insert_with(|| Json::Object(Map::new()));
    if !slot.is_object() {
        *slot = Json::Object(Map::new());
    }
    if let Json::Object(dst) = slot {
        for (k, v) in src {
            dst.insert(k.clone(), v.clone());
        }
    }
    Ok(())
}

struct ConfigMapRule;

impl MergeRule for ConfigMapRule {
    fn kind(&self) -> ObjectKind {
        ObjectKind::ConfigMap
    }

    fn merge(&self, existing: &mut Json, desired: &Json, _exists: bool) -> Result<(), ApplyError> {
        copy_field(existing, desired, &["data"])?;
        copy_field(existing, desired, &["binaryData"])
    }
}

struct SecretRule;

impl MergeRule for SecretRule {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Secret
    }

    fn merge(&self, existing: &mut Json, desired: &Json, _exists: bool) -> Result<(), ApplyError> {
        copy_field(existing, desired, &["data"])?;
        copy_field(existing, desired, &["stringData"])
    }
}

struct ServiceRule;

impl MergeRule for ServiceRule {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Service
    }

    fn merge(&self, existing: &mut Json, desired: &Json, _exists: bool) -> Result<(), ApplyError> {
        copy_field(existing, desired, &["spec", "ports"])?;
        copy_field(existing, desired, &["spec", "selector"])
    }
}

struct PersistentVolumeClaimRule;

impl MergeRule for PersistentVolumeClaimRule {
    fn kind(&self) -> ObjectKind {
        ObjectKind::PersistentVolumeClaim
    }

    fn merge(&self, existing: &mut Json, desired: &Json, _exists: bool) -> Result<(), ApplyError> {
        copy_field(existing, desired, &["spec", "resources", "requests"])
    }
}

struct DeploymentRule;

const DEPLOYMENT_SPEC_FIELDS: [&str; 6] =
    ["minReadySeconds", "paused", "progressDeadlineSeconds", "replicas", "revisionHistoryLimit", "strategy"];

/// Selector with absent and empty members dropped, so `{}` and a missing
/// `matchLabels` compare equal.
fn normalized_selector(spec_owner: &Json) -> Map<String, Json> {
    let mut out = Map::new();
    if let Some(sel) = get_path(spec_owner, &["spec", "selector"]).and_then(Json::as_object) {
        for (k, v) in sel {
            let empty = match v {
                Json::Null => true,
                Json::Object(m) => m.is_empty(),
                Json::Array(a) => a.is_empty(),
                _ => false,
            };
            if !empty {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    out
}

impl MergeRule for DeploymentRule {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Deployment
    }

    fn merge(&self, existing: &mut Json, desired: &Json, exists: bool) -> Result<(), ApplyError> {
        if exists {
            if normalized_selector(existing) != normalized_selector(desired) {
                return Err(ApplyError::ImmutableField { field: "spec.selector" });
            }
            let template_labels = get_path(desired, &["spec", "template", "metadata", "labels"]).and_then(Json::as_object);
            if let Some(Json::Object(match_labels)) = get_path(existing, &["spec", "selector", "matchLabels"]) {
                let kept = match_labels
                    .iter()
                    .all(|(k, v)| template_labels.and_then(|l| l.get(k)).map(|x| x == v).unwrap_or(false));
                if !kept {
                    return Err(ApplyError::ImmutableField { field: "spec.template.metadata.labels" });
                }
            }
        }
        for field in DEPLOYMENT_SPEC_FIELDS {
            copy_field(existing, desired, &["spec", field])?;
        }
        merge_json_map(existing, desired, &["spec", "template", "metadata", "labels"])?;
        merge_json_map(existing, desired, &["spec", "template", "metadata", "annotations"])?;
        copy_field(existing, desired, &["spec", "template", "spec"])
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TableError {
    #[error("merge rule for {0} registered twice")]
    Duplicate(ObjectKind),
    #[error("no merge rule registered for {0}")]
    Missing(ObjectKind),
}

/// Merge rules keyed by kind.
pub struct MergeRuleTable {
    rules: BTreeMap<ObjectKind, Box<dyn MergeRule>>,
}

impl MergeRuleTable {
    /// One rule per [`ObjectKind`].
    pub fn standard() -> Self {
        let rules: [Box<dyn MergeRule>; 5] = [
            Box::new(ConfigMapRule),
            Box::new(SecretRule),
            Box::new(ServiceRule),
            Box::new(PersistentVolumeClaimRule),
            Box::new(DeploymentRule),
        ];
        Self { rules: rules.into_iter().map(|r| (r.kind(), r)).collect() }
    }

    pub fn with_rules(rules: Vec<Box<dyn MergeRule>>) -> Result<Self, TableError> {
        let mut map = BTreeMap::new();
        for rule in rules {
            let kind = rule.kind();
            if map.insert(kind, rule).is_some() {
                return Err(TableError::Duplicate(kind));
            }
        }
        Ok(Self { rules: map })
    }

    /// Check that every kind in `kinds` has a rule. Run once at startup.
    pub fn ensure_complete(&self, kinds: &[ObjectKind]) -> Result<(), TableError> {
        match kinds.iter().find(|k| !self.rules.contains_key(k)) {
            Some(k) => Err(TableError::Missing(*k)),
            None => Ok(()),
        }
    }

    pub fn rule_for(&self, api_version: &str, kind: &str) -> Result<&dyn MergeRule, ApplyError> {
        ObjectKind::from_type(api_version, kind)
            .and_then(|k| self.rules.get(&k))
            .map(|r| r.as_ref())
            .ok_or_else(|| ApplyError::UnsupportedKind(format!("{api_version}/{kind}")))
    }

    pub fn kinds(&self) -> Vec<ObjectKind> {
        self.rules.keys().copied().collect()
    }
}

impl Default for MergeRuleTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labels(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
        Some(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    #[test]
    fn metadata_merge_keeps_existing_only_keys() {
        let mut existing = ObjectMeta { labels: labels(&[("a", "1"), ("keep", "x")]), ..Default::default() };
        let desired = ObjectMeta { labels: labels(&[("a", "2"), ("b", "3")]), ..Default::default() };
        merge_metadata(&mut existing, &desired);
        assert_eq!(existing.labels, labels(&[("a", "2"), ("b", "3"), ("keep", "x")]));
        assert!(existing.annotations.is_none());
    }

    #[test]
    fn service_rule_copies_ports_and_selector_only() {
        let mut existing = json!({"spec": {"clusterIP": "10.0.0.1", "ports": [{"port": 80}], "selector": {"a": "b"}}});
        let desired = json!({"spec": {"ports": [{"port": 5000}], "selector": {"c": "d"}}});
        ServiceRule.merge(&mut existing, &desired, true).unwrap();
        assert_eq!(
            existing,
            json!({"spec": {"clusterIP": "10.0.0.1", "ports": [{"port": 5000}], "selector": {"c": "d"}}})
        );
    }

    #[test]
    fn configmap_rule_drops_payload_missing_from_desired() {
        let mut existing = json!({"data": {"a": "1"}, "binaryData": {"b": "AA=="}});
        ConfigMapRule.merge(&mut existing, &json!({"data": {"x": "y"}}), true).unwrap();
        assert_eq!(existing, json!({"data": {"x": "y"}}));
    }

    fn deployment(match_labels: Json, template_labels: Json, replicas: i32) -> Json {
        json!({"spec": {
            "replicas": replicas,
            "selector": {"matchLabels": match_labels},
            "template": {"metadata": {"labels": template_labels}, "spec": {"containers": [{"name": "c"}]}}
        }})
    }

    #[test]
    fn deployment_selector_change_is_immutable() {
        let mut existing = deployment(json!({"app": "a"}), json!({"app": "a"}), 1);
        let before = existing.clone();
        let desired = deployment(json!({"app": "b"}), json!({"app": "b"}), 2);
        let err = DeploymentRule.merge(&mut existing, &desired, true).unwrap_err();
        assert!(matches!(err, ApplyError::ImmutableField { field: "spec.selector" }));
        assert_eq!(existing, before);
    }

    #[test]
    fn deployment_template_must_keep_selector_labels() {
        let mut existing = deployment(json!({"app": "a"}), json!({"app": "a"}), 1);
        let desired = deployment(json!({"app": "a"}), json!({"other": "x"}), 1);
        let err = DeploymentRule.merge(&mut existing, &desired, true).unwrap_err();
        assert!(matches!(err, ApplyError::ImmutableField { field: "spec.template.metadata.labels" }));
    }

    #[test]
    fn deployment_selector_equality_is_semantic() {
        let mut existing = json!({"spec": {"selector": {"matchLabels": {"app": "a"}, "matchExpressions": []},
            "template": {"metadata": {"labels": {"app": "a", "extra": "keep"}}}}});
        let desired = deployment(json!({"app": "a"}), json!({"app": "a"}), 3);
        DeploymentRule.merge(&mut existing, &desired, true).unwrap();
        assert_eq!(existing["spec"]["replicas"], 3);
        assert_eq!(existing["spec"]["template"]["metadata"]["labels"], json!({"app": "a", "extra": "keep"}));
        assert_eq!(existing["spec"]["template"]["spec"], json!({"containers": [{"name": "c"}]}));
    }

    #[test]
    fn deployment_selector_is_not_checked_on_create() {
        let mut template = deployment(json!({"app": "b"}), json!({"app": "b"}), 1);
        let desired = template.clone();
        DeploymentRule.merge(&mut template, &desired, false).unwrap();
        assert_eq!(template, desired);
    }

    #[test]
    fn table_rejects_duplicates_and_reports_missing_kinds() {
        let dup = MergeRuleTable::with_rules(vec![Box::new(ServiceRule) as Box<dyn MergeRule>, Box::new(ServiceRule)]);
        assert_eq!(dup.err(), Some(TableError::Duplicate(ObjectKind::Service)));

        let partial = MergeRuleTable::with_rules(vec![Box::new(ServiceRule) as Box<dyn MergeRule>]).unwrap();
        assert_eq!(partial.ensure_complete(&ObjectKind::ALL), Err(TableError::Missing(ObjectKind::ConfigMap)));
        assert!(MergeRuleTable::standard().ensure_complete(&ObjectKind::ALL).is_ok());
    }

    #[test]
    fn unknown_kinds_are_unsupported() {
        let table = MergeRuleTable::standard();
        let err = table.rule_for("batch/v1", "CronJob").err().unwrap();
        assert!(matches!(err, ApplyError::UnsupportedKind(k) if k == "batch/v1/CronJob"));
    }
}
