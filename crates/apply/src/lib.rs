//! Registry apply: the convergence engine.
//!
//! [`Converger::converge`] walks the desired objects in builder order, merges
//! each into its stored counterpart (or creates it), then deletes whatever is
//! left in the owner's [`OwnershipIndex`]. Failures are per object: one bad
//! object never stops its siblings, and all of them come back together as an
//! [`AggregateError`].

#![forbid(unsafe_code)]

use std::time::Instant;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use kube::Resource;
use metrics::{counter, histogram};
use registry_core::{uid_of, ObjectKey, OperationResult, Registry};
use registry_store::{create_or_update, ObjectStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod diff;
mod error;
pub mod merge;
pub mod owned;
pub mod retry;

pub use diff::{diff_summary, strip_noisy, DiffSummary};
pub use error::{AggregateError, ApplyError, ConvergeError, ObjectError};
pub use merge::{merge_metadata, MergeRule, MergeRuleTable, TableError};
pub use owned::{find_owned, OwnershipIndex};
pub use retry::{retry_on, RetryError, RetryPolicy};

/// What happened to one desired object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied(OperationResult),
    /// An immutable field changed; the stored object was deleted and the next
    /// pass recreates it.
    Deleted,
}

#[derive(Debug, Clone, Default)]
pub struct ConvergeReport {
    pub outcomes: Vec<(ObjectKey, Outcome)>,
    pub pruned: Vec<ObjectKey>,
}

impl ConvergeReport {
    pub fn count(&self, result: OperationResult) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == Outcome::Applied(result)).count()
    }

    pub fn outcome(&self, key: &ObjectKey) -> Option<Outcome> {
        self.outcomes.iter().find(|(k, _)| k == key).map(|(_, o)| *o)
    }

    /// True when the pass wrote nothing.
    pub fn is_noop(&self) -> bool {
        self.pruned.is_empty() && self.outcomes.iter().all(|(_, o)| *o == Outcome::Applied(OperationResult::Unchanged))
    }
}

fn result_label(r: OperationResult) -> &'static str {
    match r {
        OperationResult::Created => "created",
        OperationResult::Updated => "updated",
        OperationResult::Unchanged => "unchanged",
    }
}

/// Attach `owner` as controller, replacing any earlier reference to it.
fn attach_owner(obj: &mut DynamicObject, owner: &OwnerReference) {
    let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
    refs.retain(|r| r.uid != owner.uid);
    refs.push(owner.clone());
}

pub struct Converger {
    rules: MergeRuleTable,
    retry: RetryPolicy,
}

impl Default for Converger {
    fn default() -> Self {
        Self::new(MergeRuleTable::standard(), RetryPolicy::default())
    }
}

impl Converger {
    pub fn new(rules: MergeRuleTable, retry: RetryPolicy) -> Self {
        Self { rules, retry }
    }

    pub fn rules(&self) -> &MergeRuleTable {
        &self.rules
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Converge `desired` for `owner`, consuming `owned`.
    ///
    /// On cancellation returns [`ConvergeError::Cancelled`] right away and
    /// skips pruning.
    pub async fn converge<S>(
        &self,
        store: &S,
        owner: &Registry,
        desired: &[DynamicObject],
        owned: &mut OwnershipIndex,
        token: &CancellationToken,
    ) -> Result<ConvergeReport, ConvergeError>
    where
        S: ObjectStore + ?Sized,
    {
        let t0 = Instant::now();
        let owner_ref = owner.controller_owner_ref(&());
        let mut report = ConvergeReport::default();
        let mut errors = AggregateError::default();

        for obj in desired {
            if token.is_cancelled() {
                return Err(ConvergeError::Cancelled);
            }
            let key = match ObjectKey::of(obj) {
                Ok(k) => k,
                Err(e) => {
                    errors.apply.push(ObjectError::new("<unnamed>", ApplyError::InvalidObject(e.to_string())));
                    continue;
                }
            };
            match self.apply_one(store, owner, owner_ref.as_ref(), obj, &key, token).await {
                Ok((result, stored)) => {
                    counter!("converge_objects", 1u64, "result" => result_label(result));
                    let removed = uid_of(&stored).and_then(|uid| owned.remove(&uid)).is_some();
                    if !removed {
                        owned.take_key(&key);
                    }
                    report.outcomes.push((key, Outcome::Applied(result)));
                }
                Err(ApplyError::Cancelled) => return Err(ConvergeError::Cancelled),
                Err(ApplyError::ImmutableField { field }) => {
                    warn!(object = %key, field, "immutable field changed; deleting for recreation");
                    counter!("converge_recreated", 1u64);
                    let existing = match owned.take_key(&key) {
                        Some(o) => Some(o),
                        None => {
                            let res = tokio::select! {
                                biased;
                                _ = token.cancelled() => return Err(ConvergeError::Cancelled),
                                r = store.get(&key) => r,
                            };
                            match res {
                                Ok(found) => found,
                                Err(e) => {
                                    warn!(object = %key, error = %e, "reading object for recreation failed");
                                    errors.apply.push(ObjectError::new(&key, ApplyError::Store(e)));
                                    continue;
                                }
                            }
                        }
                    };
                    let Some(existing) = existing else {
                        report.outcomes.push((key, Outcome::Deleted));
                        continue;
                    };
                    let res = tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(ConvergeError::Cancelled),
                        r = store.delete(&existing) => r,
                    };
                    match res {
                        Ok(()) => report.outcomes.push((key, Outcome::Deleted)),
                        Err(e) if e.is_not_found() => report.outcomes.push((key, Outcome::Deleted)),
                        Err(e) => errors.apply.push(ObjectError::new(&key, ApplyError::Store(e))),
                    }
                }
                Err(e) => {
                    counter!("converge_errors", 1u64);
                    warn!(object = %key, error = %e, "apply failed");
                    // Keep it out of the prune set: a failed apply must not
                    // turn into a delete in the same pass.
                    owned.take_key(&key);
                    errors.apply.push(ObjectError::new(&key, e));
                }
            }
        }

        for orphan in owned.drain() {
            let key = ObjectKey::of(&orphan).map(|k| k.to_string()).unwrap_or_else(|_| "<unnamed>".into());
            let res = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ConvergeError::Cancelled),
                r = store.delete(&orphan) => r,
            };
            match res {
                Ok(()) => {
                    counter!("prune_deleted", 1u64);
                    info!(object = %key, "pruned orphan");
                    if let Ok(k) = ObjectKey::of(&orphan) {
                        report.pruned.push(k);
                    }
                }
                Err(e) if e.is_not_found() => debug!(object = %key, "orphan already gone"),
                Err(e) => {
                    counter!("prune_errors", 1u64);
                    warn!(object = %key, error = %e, "prune failed");
                    errors.prune.push(ObjectError::new(key, ApplyError::Store(e)));
                }
            }
        }

        histogram!("converge_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(
            owner = %owner.name(),
            applied = report.outcomes.len(),
            pruned = report.pruned.len(),
            errors = errors.len(),
            "converge finished"
        );
        if errors.is_empty() {
            Ok(report)
        } else {
            Err(ConvergeError::Aggregate(errors))
        }
    }

    async fn apply_one<S>(
        &self,
        store: &S,
        owner: &Registry,
        owner_ref: Option<&OwnerReference>,
        obj: &DynamicObject,
        key: &ObjectKey,
        token: &CancellationToken,
    ) -> Result<(OperationResult, DynamicObject), ApplyError>
    where
        S: ObjectStore + ?Sized,
    {
        let owner_ref = owner_ref.ok_or_else(|| {
            ApplyError::OwnerReference(format!("Registry {}/{} has no uid", owner.namespace(), owner.name()))
        })?;
        let rule = self.rules.rule_for(&key.api_version, &key.kind)?;
        let mut desired = obj.clone();
        attach_owner(&mut desired, owner_ref);
        let desired = &desired;

        let res = retry_on(self.retry, token, ApplyError::is_conflict, || async move {
            let mut before = None;
            let out = create_or_update(store, desired.clone(), |existing, exists| {
                if exists {
                    before = serde_json::to_value(&*existing).ok();
                }
                merge_metadata(&mut existing.metadata, &desired.metadata);
                rule.merge(&mut existing.data, &desired.data, exists)
            })
            .await?;
            if let (OperationResult::Updated, Some(before)) = (out.0, before) {
                let after = serde_json::to_value(&out.1).unwrap_or_default();
                let summary = diff_summary(&strip_noisy(after), &strip_noisy(before));
                debug!(object = %key, adds = summary.adds, updates = summary.updates, removes = summary.removes, "diff");
            }
            Ok::<_, ApplyError>(out)
        })
        .await;

        res.map_err(|e| match e {
            RetryError::Cancelled => ApplyError::Cancelled,
            RetryError::Exhausted { attempts, .. } => ApplyError::Conflict { key: key.clone(), attempts },
            RetryError::Failed(e) => e,
        })
    }
}
