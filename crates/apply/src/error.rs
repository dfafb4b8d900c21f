use std::fmt;

use registry_core::ObjectKey;
use registry_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("cannot reference owner: {0}")]
    OwnerReference(String),
    #[error("no merge rule for kind {0}")]
    UnsupportedKind(String),
    /// The object must be deleted and recreated; never fails the pass.
    #[error("immutable field {field} would change")]
    ImmutableField { field: &'static str },
    #[error("{key}: write conflict persisted after {attempts} attempts")]
    Conflict { key: ObjectKey, attempts: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid object: {0}")]
    InvalidObject(String),
    #[error("cancelled")]
    Cancelled,
}

impl ApplyError {
    /// Worth another read-merge-write round: a stale resource version, or a
    /// create that lost a race with another writer.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ApplyError::Store(e) if e.is_conflict() || matches!(e, StoreError::AlreadyExists(_)))
    }
}

/// One failed object, by identity.
#[derive(Debug)]
pub struct ObjectError {
    pub object: String,
    pub error: ApplyError,
}

impl ObjectError {
    pub fn new(object: impl fmt::Display, error: ApplyError) -> Self {
        Self { object: object.to_string(), error }
    }
}

impl fmt::Display for ObjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.object, self.error)
    }
}

/// Every per-object failure of one pass, apply phase and prune phase kept
/// apart.
#[derive(Debug, Default)]
pub struct AggregateError {
    pub apply: Vec<ObjectError>,
    pub prune: Vec<ObjectError>,
}

impl AggregateError {
    pub fn is_empty(&self) -> bool {
        self.apply.is_empty() && self.prune.is_empty()
    }

    pub fn len(&self) -> usize {
        self.apply.len() + self.prune.len()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (phase, errs) in [("apply", &self.apply), ("prune", &self.prune)] {
            for e in errs {
                if !first {
                    f.write_str("; ")?;
                }
                first = false;
                write!(f, "{phase} {e}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

#[derive(Debug, thiserror::Error)]
pub enum ConvergeError {
    #[error(transparent)]
    Aggregate(AggregateError),
    #[error("convergence cancelled")]
    Cancelled,
}
