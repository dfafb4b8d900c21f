//! Migration steps shipped with this release, oldest first.

use registry_core::{Registry, Storage};
use semver::Version;

use crate::{MigrationStep, StepContext, StepError};

/// The release steps in order.
pub fn standard() -> Vec<MigrationStep> {
    vec![
        MigrationStep::new(Version::new(2, 8, 3), v2_8_3),
        MigrationStep::new(Version::new(3, 0, 0), v3_0_0),
    ]
}

/// First tracked release; nothing to change.
pub fn v2_8_3(_: &StepContext, registry: Registry) -> Result<Registry, StepError> {
    Ok(registry)
}

/// Storage became configurable in 3.0.0. Instances created before that ran on
/// an unbounded scratch volume; pin them to the explicit default.
pub fn v3_0_0(_: &StepContext, mut registry: Registry) -> Result<Registry, StepError> {
    if registry.spec.storage.is_none() {
        registry.spec.storage = Some(Storage::default_empty_dir());
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_core::RegistrySpec;

    #[test]
    fn steps_are_ordered() {
        let steps = standard();
        assert!(steps.windows(2).all(|w| w[0].version < w[1].version));
    }

    fn ctx() -> StepContext {
        StepContext { from: Version::new(2, 8, 3), target: Version::new(3, 0, 0) }
    }

    #[test]
    fn v3_keeps_configured_storage() {
        let mut r = Registry::new("ns", "r", RegistrySpec::default());
        r.spec.storage = Some(Storage::S3(Default::default()));
        let out = v3_0_0(&ctx(), r.clone()).unwrap();
        assert_eq!(out, r);

        let bare = v3_0_0(&ctx(), Registry::new("ns", "r", RegistrySpec::default())).unwrap();
        assert_eq!(bare.spec.storage, Some(Storage::default_empty_dir()));
    }
}
