//! Version compatibility gate.
//!
//! Some releases break the internal protocol between versions. A rolling
//! upgrade onto such a release cannot succeed, so the scenario is skipped
//! before any node is touched.

use rollout_core::Version;

use crate::error::IncompatibleVersion;

/// Version prefixes that can never be rolled onto from an older release.
pub const DEFAULT_INCOMPATIBLE_PREFIXES: &[&str] = &["0.25"];

/// Decides whether an upgrade from one version to another is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityPolicy {
    incompatible_prefixes: Vec<String>,
}

impl Default for CompatibilityPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_INCOMPATIBLE_PREFIXES.iter().copied())
    }
}

impl CompatibilityPolicy {
    /// Creates a policy rejecting target versions with any of `prefixes`.
    #[must_use]
    pub fn new<'a>(prefixes: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            incompatible_prefixes: prefixes.into_iter().map(str::to_string).collect(),
        }
    }

    /// A policy accepting every pair.
    #[must_use]
    pub const fn permissive() -> Self {
        Self {
            incompatible_prefixes: Vec::new(),
        }
    }

    /// Checks whether `to` can be rolled onto a cluster running `from`.
    ///
    /// # Errors
    /// Returns [`IncompatibleVersion`] naming the matching prefix.
    pub fn check(&self, from: &Version, to: &Version) -> Result<(), IncompatibleVersion> {
        match self
            .incompatible_prefixes
            .iter()
            .find(|prefix| to.starts_with(prefix))
        {
            Some(prefix) => Err(IncompatibleVersion {
                from: from.clone(),
                to: to.clone(),
                reason: format!("versions starting with {prefix} break the inter-node protocol"),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rejects_0_25() {
        let policy = CompatibilityPolicy::default();
        let from = Version::from("0.24.3");

        let err = policy.check(&from, &Version::from("0.25.0")).unwrap_err();
        assert_eq!(err.to, Version::from("0.25.0"));
        assert!(err.reason.contains("0.25"));

        assert!(policy.check(&from, &Version::from("0.24.4")).is_ok());
        assert!(policy.check(&from, &Version::from("0.26.0")).is_ok());
    }

    #[test]
    fn test_permissive_accepts_everything() {
        let policy = CompatibilityPolicy::permissive();
        assert!(policy
            .check(&Version::from("0.24.0"), &Version::from("0.25.0"))
            .is_ok());
    }
}
