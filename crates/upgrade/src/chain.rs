use std::fmt;

use registry_core::Registry;
use semver::Version;
use tracing::{debug, info};

/// Read-only release data handed to every step of one migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepContext {
    /// Marker the instance carried before this migration started.
    pub from: Version,
    /// Version recorded once every step has run.
    pub target: Version,
}

/// One release's transform over a stored instance.
pub type Transform = fn(&StepContext, Registry) -> Result<Registry, StepError>;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StepError(pub String);

#[derive(Clone)]
pub struct MigrationStep {
    pub version: Version,
    pub transform: Transform,
}

impl MigrationStep {
    pub fn new(version: Version, transform: Transform) -> Self {
        Self { version, transform }
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep").field("version", &self.version).finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("migration chain has no steps")]
    Empty,
    #[error("step {next} does not follow {prev}")]
    NotIncreasing { prev: Version, next: Version },
    #[error("target version {target} is behind the last step {last}")]
    TargetBehind { target: Version, last: Version },
    #[error("invalid target version {0:?}: {1}")]
    Target(String, String),
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// The recorded marker is not a version. The instance is returned as it
    /// was read.
    #[error("failed to parse version {recorded:?}: {source}")]
    Parse {
        recorded: String,
        source: semver::Error,
        instance: Box<Registry>,
    },
    /// A step failed. The instance carries every step before it, with the
    /// marker at the last completed step.
    #[error("migration step {version} failed: {source}")]
    Step {
        version: Version,
        source: StepError,
        instance: Box<Registry>,
    },
}

impl MigrationError {
    pub fn instance(&self) -> &Registry {
        match self {
            MigrationError::Parse { instance, .. } | MigrationError::Step { instance, .. } => instance,
        }
    }

    pub fn into_instance(self) -> Registry {
        match self {
            MigrationError::Parse { instance, .. } | MigrationError::Step { instance, .. } => *instance,
        }
    }
}

/// Parse a version marker; a leading `v` is accepted.
pub fn parse_marker(marker: &str) -> Result<Version, semver::Error> {
    Version::parse(marker.strip_prefix('v').unwrap_or(marker))
}

/// Ordered release steps plus the version this build records once every step
/// has run. Built once and shared read-only.
#[derive(Debug, Clone)]
pub struct MigrationChain {
    steps: Vec<MigrationStep>,
    target: Version,
}

impl MigrationChain {
    pub fn new(steps: Vec<MigrationStep>, target: Version) -> Result<Self, ChainError> {
        let Some(last) = steps.last() else {
            return Err(ChainError::Empty);
        };
        if let Some(w) = steps.windows(2).find(|w| w[0].version >= w[1].version) {
            return Err(ChainError::NotIncreasing { prev: w[0].version.clone(), next: w[1].version.clone() });
        }
        if target < last.version {
            return Err(ChainError::TargetBehind { target, last: last.version.clone() });
        }
        Ok(Self { steps, target })
    }

    /// The shipped steps with `target` as the final marker.
    pub fn standard(target: &str) -> Result<Self, ChainError> {
        let target = parse_marker(target).map_err(|e| ChainError::Target(target.to_string(), e.to_string()))?;
        Self::new(crate::steps::standard(), target)
    }

    pub fn target(&self) -> &Version {
        &self.target
    }

    /// Version of the newest step.
    pub fn latest(&self) -> &Version {
        // `new` rejects empty step lists
        &self.steps[self.steps.len() - 1].version
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    /// Bring `registry` up to the target version.
    ///
    /// New instances (empty marker) come back untouched. Instances recorded
    /// ahead of the newest step only get their marker raised, and only when
    /// the target is newer. Everything else runs each step newer than the
    /// marker, in order, and ends at the target.
    pub fn migrate(&self, registry: Registry) -> Result<Registry, MigrationError> {
        let recorded = registry.status.version.clone();
        if recorded.is_empty() {
            return Ok(registry);
        }
        let current = match parse_marker(&recorded) {
            Ok(v) => v,
            Err(source) => {
                return Err(MigrationError::Parse { recorded, source, instance: Box::new(registry) });
            }
        };

        let mut updated = registry;
        if current > *self.latest() {
            if self.target > current {
                info!(registry = %updated.name(), from = %current, to = %self.target, "raised version marker");
                updated.status.version = self.target.to_string();
            } else {
                debug!(registry = %updated.name(), version = %current, "no migration needed");
            }
            return Ok(updated);
        }

        let ctx = StepContext { from: current.clone(), target: self.target.clone() };
        for step in self.steps.iter().filter(|s| s.version > current) {
            let before = updated.clone();
            match (step.transform)(&ctx, updated) {
                Ok(mut next) => {
                    next.status.version = step.version.to_string();
                    debug!(registry = %next.name(), version = %step.version, "migration step applied");
                    metrics::counter!("migrate_steps", 1u64);
                    updated = next;
                }
                Err(source) => {
                    metrics::counter!("migrate_errors", 1u64);
                    return Err(MigrationError::Step {
                        version: step.version.clone(),
                        source,
                        instance: Box::new(before),
                    });
                }
            }
        }
        updated.status.version = self.target.to_string();
        Ok(updated)
    }
}
