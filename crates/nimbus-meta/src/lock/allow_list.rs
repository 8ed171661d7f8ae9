//! Hot-reloadable routing of instances to lock protocol versions.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use nimbus_core::id::InstanceId;
use tracing::info;

use super::LockVersion;

/// Set of instances that use the tablet-scoped (v2) lock protocol.
///
/// Parsed from a `;`-separated list such as `warehouse2;warehouse3`. An
/// empty value or the literal `''` means no instance uses v2. Updating the
/// list affects subsequent lookups only.
#[derive(Debug, Default)]
pub struct LockVersionAllowList {
    instances: RwLock<HashSet<String>>,
}

impl LockVersionAllowList {
    /// Builds the list from its configuration value.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        Self {
            instances: RwLock::new(parse_instances(value)),
        }
    }

    /// Replaces the list.
    pub fn update(&self, value: &str) {
        let parsed = parse_instances(value);
        info!(instances = parsed.len(), "updated delete bitmap lock v2 allow list");
        *self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner) = parsed;
    }

    /// Protocol version for an instance.
    #[must_use]
    pub fn version_for(&self, instance: &InstanceId) -> LockVersion {
        let instances = self
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if instances.contains(instance.as_str()) {
            LockVersion::V2
        } else {
            LockVersion::V1
        }
    }
}

fn parse_instances(value: &str) -> HashSet<String> {
    let value = value.trim();
    if value.is_empty() || value == "''" {
        return HashSet::new();
    }
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
