//! Workload optimizer - named profiles that override automatic prioritization.
//!
//! At most one profile is active. Activation resolves tag selectors against
//! the registry and closes the force-enabled set over dependencies; the
//! scheduler consumes the resolved constraints on its next tick.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::tools::registry::ToolRegistry;
use crate::types::{Error, ProfileName, Result, ToolId};

/// Named enable/disable set for a declared workload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadProfile {
    pub name: ProfileName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tools forced Running.
    #[serde(default)]
    pub enable: BTreeSet<ToolId>,
    /// Tools forced Stopped.
    #[serde(default)]
    pub disable: BTreeSet<ToolId>,
    /// Workload tags whose tools are forced Running.
    #[serde(default)]
    pub enable_tags: BTreeSet<String>,
    /// Workload tags whose tools are forced Stopped.
    #[serde(default)]
    pub disable_tags: BTreeSet<String>,
}

impl WorkloadProfile {
    pub fn new(name: &str) -> Self {
        Self {
            name: ProfileName::must(name),
            description: None,
            enable: BTreeSet::new(),
            disable: BTreeSet::new(),
            enable_tags: BTreeSet::new(),
            disable_tags: BTreeSet::new(),
        }
    }

    pub fn enabling(mut self, tool: &str) -> Self {
        self.enable.insert(ToolId::must(tool));
        self
    }

    pub fn disabling(mut self, tool: &str) -> Self {
        self.disable.insert(ToolId::must(tool));
        self
    }

    pub fn enabling_tag(mut self, tag: &str) -> Self {
        self.enable_tags.insert(tag.to_string());
        self
    }

    pub fn disabling_tag(mut self, tag: &str) -> Self {
        self.disable_tags.insert(tag.to_string());
        self
    }

    /// Reject references to unknown tools and contradictory entries.
    pub fn validate(&self, registry: &ToolRegistry) -> Result<()> {
        if let Some(unknown) = self
            .enable
            .iter()
            .chain(self.disable.iter())
            .find(|id| !registry.contains(id))
        {
            return Err(Error::validation(format!(
                "profile {} references unknown tool {}",
                self.name, unknown
            )));
        }
        if let Some(both) = self.enable.intersection(&self.disable).next() {
            return Err(Error::validation(format!(
                "profile {} both enables and disables {}",
                self.name, both
            )));
        }
        Ok(())
    }

    /// Concrete id sets for the current registry.
    ///
    /// Explicit ids win over tags; between tags, disable wins. Dependencies of
    /// force-enabled tools are enabled too unless the profile disables them.
    pub fn resolve(&self, registry: &ToolRegistry) -> ResolvedProfile {
        let tagged = |tags: &BTreeSet<String>| -> BTreeSet<ToolId> {
            tags.iter().flat_map(|t| registry.ids_with_tag(t)).collect()
        };

        let mut force_disabled: BTreeSet<ToolId> = self.disable.clone();
        force_disabled.extend(
            tagged(&self.disable_tags)
                .into_iter()
                .filter(|id| !self.enable.contains(id)),
        );

        let mut roots: BTreeSet<ToolId> = self.enable.clone();
        roots.extend(
            tagged(&self.enable_tags)
                .into_iter()
                .filter(|id| !force_disabled.contains(id)),
        );

        let mut force_enabled = roots.clone();
        for root in &roots {
            force_enabled.extend(
                registry
                    .transitive_dependencies(root)
                    .into_iter()
                    .filter(|dep| !force_disabled.contains(dep)),
            );
        }

        ResolvedProfile {
            name: self.name.clone(),
            force_enabled,
            force_disabled,
        }
    }
}

/// Profile constraints as consumed by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedProfile {
    pub name: ProfileName,
    pub force_enabled: BTreeSet<ToolId>,
    pub force_disabled: BTreeSet<ToolId>,
}

/// Holds profile definitions and the single active profile.
#[derive(Debug, Default)]
pub struct WorkloadOptimizer {
    profiles: HashMap<ProfileName, WorkloadProfile>,
    active: Option<(WorkloadProfile, Arc<ResolvedProfile>)>,
}

impl WorkloadOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a profile definition.
    pub fn define(&mut self, profile: WorkloadProfile, registry: &ToolRegistry) -> Result<()> {
        profile.validate(registry)?;
        tracing::debug!("profile_defined: name={}", profile.name);
        self.profiles.insert(profile.name.clone(), profile);
        Ok(())
    }

    pub fn profile_names(&self) -> Vec<ProfileName> {
        let mut names: Vec<ProfileName> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    /// Activate a profile, atomically replacing any active one.
    pub fn activate(&mut self, name: &str, registry: &ToolRegistry) -> Result<Arc<ResolvedProfile>> {
        let profile = self
            .profiles
            .get(name)
            .cloned()
            .ok_or_else(|| Error::unknown_profile(name))?;
        let resolved = Arc::new(profile.resolve(registry));
        if let Some((previous, _)) = &self.active {
            tracing::info!("profile_replaced: previous={}, next={}", previous.name, profile.name);
        } else {
            tracing::info!("profile_activated: name={}", profile.name);
        }
        self.active = Some((profile, resolved.clone()));
        Ok(resolved)
    }

    /// Deactivate the active profile, returning it.
    pub fn deactivate(&mut self) -> Option<WorkloadProfile> {
        let previous = self.active.take().map(|(profile, _)| profile);
        if let Some(profile) = &previous {
            tracing::info!("profile_deactivated: name={}", profile.name);
        }
        previous
    }

    pub fn current_profile(&self) -> Option<&WorkloadProfile> {
        self.active.as_ref().map(|(profile, _)| profile)
    }

    /// Constraints for the next tick.
    pub fn constraints(&self) -> Option<Arc<ResolvedProfile>> {
        self.active.as_ref().map(|(_, resolved)| resolved.clone())
    }
}
