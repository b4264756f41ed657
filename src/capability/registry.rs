//! Capability registry and stage planning.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::capability::capability::{Capability, CapabilityKind};
use crate::error::RegistryError;

/// Dependency-ordered execution plan.
///
/// Stage `n` holds the capabilities whose longest dependency chain has
/// length `n`. Capabilities inside a stage never depend on each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    stages: Vec<Vec<CapabilityKind>>,
}

impl StagePlan {
    pub fn stages(&self) -> &[Vec<CapabilityKind>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Total number of capabilities across all stages.
    pub fn capability_count(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }

    /// Zero-based stage index of a capability.
    pub fn stage_of(&self, kind: CapabilityKind) -> Option<usize> {
        self.stages.iter().position(|stage| stage.contains(&kind))
    }
}

/// Registry of available capabilities.
///
/// Built once before the engine is constructed; lookups afterwards are
/// read-only.
#[derive(Default)]
pub struct CapabilityRegistry {
    /// Registration order; used for deterministic ordering inside a stage.
    capabilities: Vec<Arc<dyn Capability>>,
    /// Variable name -> owning capability.
    owners: HashMap<String, CapabilityKind>,
}

impl CapabilityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability. Rejects a second implementation of the same
    /// kind and any variable already owned by another capability.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<(), RegistryError> {
        let kind = capability.kind();
        if self.has(kind) {
            return Err(RegistryError::DuplicateCapability(kind));
        }
        for variable in capability.outputs() {
            if let Some(owner) = self.owners.get(*variable) {
                return Err(RegistryError::DuplicateOutput {
                    variable: variable.to_string(),
                    owner: *owner,
                    capability: kind,
                });
            }
        }
        for variable in capability.outputs() {
            self.owners.insert(variable.to_string(), kind);
        }
        tracing::debug!(capability = %kind, provider = capability.provider(), "Registered capability");
        self.capabilities.push(capability);
        Ok(())
    }

    /// Get a capability by kind.
    pub fn get(&self, kind: CapabilityKind) -> Option<Arc<dyn Capability>> {
        self.capabilities
            .iter()
            .find(|c| c.kind() == kind)
            .cloned()
    }

    /// Check if a capability is registered.
    pub fn has(&self, kind: CapabilityKind) -> bool {
        self.capabilities.iter().any(|c| c.kind() == kind)
    }

    /// Registered kinds in registration order.
    pub fn kinds(&self) -> Vec<CapabilityKind> {
        self.capabilities.iter().map(|c| c.kind()).collect()
    }

    /// Get the number of registered capabilities.
    pub fn count(&self) -> usize {
        self.capabilities.len()
    }

    /// Capability that owns a variable.
    pub fn owner_of(&self, variable: &str) -> Option<CapabilityKind> {
        self.owners.get(variable).copied()
    }

    /// Every variable some registered capability produces.
    pub fn produced_variables(&self) -> BTreeSet<String> {
        self.owners.keys().cloned().collect()
    }

    /// Registered capabilities a capability depends on, derived from the
    /// owners of its required inputs.
    pub fn dependencies(&self, kind: CapabilityKind) -> Vec<CapabilityKind> {
        let Some(capability) = self.get(kind) else {
            return Vec::new();
        };
        let mut deps: Vec<CapabilityKind> = capability
            .required_inputs()
            .iter()
            .filter_map(|input| self.owner_of(input))
            .filter(|owner| *owner != kind)
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }

    /// Layer the registered capabilities into dependency stages.
    pub fn plan(&self) -> Result<StagePlan, RegistryError> {
        if self.capabilities.is_empty() {
            return Err(RegistryError::Empty);
        }

        let deps: HashMap<CapabilityKind, Vec<CapabilityKind>> = self
            .kinds()
            .into_iter()
            .map(|kind| (kind, self.dependencies(kind)))
            .collect();

        let mut placed: BTreeSet<CapabilityKind> = BTreeSet::new();
        let mut remaining = self.kinds();
        let mut stages = Vec::new();

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = remaining
                .into_iter()
                .partition(|kind| deps[kind].iter().all(|d| placed.contains(d)));
            if ready.is_empty() {
                return Err(RegistryError::Cycle(blocked));
            }
            placed.extend(ready.iter().copied());
            stages.push(ready);
            remaining = blocked;
        }

        Ok(StagePlan { stages })
    }
}
