// ============================================================================
// SUBMODULE ORCHESTRATOR
// ============================================================================
// Holds an explicit, author-declared ordered list of submodules and drives
// them through the lifecycle:
//
//   1. validate every declared dependency against earlier submodules or
//      external capabilities (nothing runs if this fails)
//   2. `init` every submodule, in order
//   3. `start_up` every submodule, in the same order
//
// The declared order is authoritative. Dependencies are checked against it,
// never used to compute it.
// ============================================================================

use std::collections::{BTreeSet, HashMap};

use tracing::{error, info};

use crate::error::{CompositionError, SubmoduleError};
use crate::lifecycle::{Capability, LifecycleState, Submodule, SubmoduleContext};
use crate::log_lifecycle;

/// A submodule together with its lifecycle state.
#[derive(Debug)]
struct Slot {
    module: Box<dyn Submodule>,
    state: LifecycleState,
}

/// Snapshot of one submodule's descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmoduleDescriptor {
    pub name: String,
    pub dependencies: BTreeSet<Capability>,
    pub provided_capability: Option<Capability>,
    pub state: LifecycleState,
}

#[derive(Debug, Default)]
pub struct SubmoduleOrchestrator {
    slots: Vec<Slot>,
}

impl SubmoduleOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a submodule; it will be activated after every earlier one.
    pub fn with(mut self, module: impl Submodule + 'static) -> Self {
        self.push(Box::new(module));
        self
    }

    pub fn push(&mut self, module: Box<dyn Submodule>) {
        self.slots.push(Slot {
            module,
            state: LifecycleState::Uninitialized,
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn descriptors(&self) -> Vec<SubmoduleDescriptor> {
        self.slots
            .iter()
            .map(|slot| SubmoduleDescriptor {
                name: slot.module.name().to_string(),
                dependencies: slot.module.dependencies().into_iter().collect(),
                provided_capability: slot.module.provided_capability(),
                state: slot.state,
            })
            .collect()
    }

    pub fn state_of(&self, name: &str) -> Option<LifecycleState> {
        self.slots
            .iter()
            .find(|slot| slot.module.name() == name)
            .map(|slot| slot.state)
    }

    /// Declared dependencies that no submodule provides; these must come from
    /// outside the engine.
    pub fn external_dependencies(&self) -> BTreeSet<Capability> {
        let provided: BTreeSet<Capability> = self
            .slots
            .iter()
            .filter_map(|slot| slot.module.provided_capability())
            .collect();
        self.slots
            .iter()
            .flat_map(|slot| slot.module.dependencies())
            .filter(|dep| !provided.contains(dep))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    /// Check every dependency against earlier submodules and the capabilities
    /// already registered in `ctx`.
    pub fn validate(&self, ctx: &SubmoduleContext) -> Result<(), CompositionError> {
        let mut providers: HashMap<Capability, usize> = HashMap::new();
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(capability) = slot.module.provided_capability() {
                if let Some(first) = providers.get(&capability) {
                    return Err(CompositionError::DuplicateCapability {
                        capability,
                        first: self.slots[*first].module.name().to_string(),
                        second: slot.module.name().to_string(),
                    });
                }
                providers.insert(capability, index);
            }
        }

        for (index, slot) in self.slots.iter().enumerate() {
            for capability in slot.module.dependencies() {
                match providers.get(&capability) {
                    Some(provider) if *provider < index => {}
                    Some(provider) => {
                        return Err(CompositionError::DependencyOrder {
                            submodule: slot.module.name().to_string(),
                            capability,
                            provider: self.slots[*provider].module.name().to_string(),
                        });
                    }
                    None if ctx.has(&capability) => {}
                    None => {
                        return Err(CompositionError::MissingDependency {
                            submodule: slot.module.name().to_string(),
                            capability,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------------

    /// Validate, then `init` all submodules, then `start_up` all submodules.
    /// Any failure aborts the whole sequence.
    pub async fn compose(&mut self, ctx: &mut SubmoduleContext) -> Result<(), CompositionError> {
        if self
            .slots
            .iter()
            .any(|slot| slot.state != LifecycleState::Uninitialized)
        {
            return Err(CompositionError::AlreadyComposed);
        }

        self.validate(ctx).map_err(|e| {
            error!(target: "flowwatch::orchestrator", error = %e, "Submodule composition rejected");
            e
        })?;

        for slot in &mut self.slots {
            let name = slot.module.name().to_string();
            let result = match slot.module.init(ctx).await {
                Ok(()) => match slot.module.provided_capability() {
                    Some(capability) if !ctx.has(&capability) => {
                        Err(SubmoduleError::MissingService { capability })
                    }
                    _ => Ok(()),
                },
                Err(e) => Err(e),
            };
            if let Err(source) = result {
                error!(target: "flowwatch::orchestrator", submodule = %name, error = %source, "Init failed");
                return Err(CompositionError::InitFailed { submodule: name, source });
            }
            slot.state.advance_to(LifecycleState::Initialized);
            log_lifecycle!(name, slot.state);
        }

        for slot in &mut self.slots {
            let name = slot.module.name().to_string();
            if let Err(source) = slot.module.start_up(ctx).await {
                error!(target: "flowwatch::orchestrator", submodule = %name, error = %source, "Start-up failed");
                return Err(CompositionError::StartFailed { submodule: name, source });
            }
            slot.state.advance_to(LifecycleState::Started);
            log_lifecycle!(name, slot.state);
        }

        info!(
            target: "flowwatch::orchestrator",
            submodules = self.slots.len(),
            "All submodules started"
        );
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
