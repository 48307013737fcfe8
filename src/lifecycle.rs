// ============================================================================
// SUBMODULE LIFECYCLE
// ============================================================================
// The activation protocol shared by every cooperating component:
//
//   UNINITIALIZED ──init──▶ INITIALIZED ──start_up──▶ STARTED
//
// `init` makes a capability addressable (registers its service in the
// context); `start_up` makes it operate (spawns loops, opens channels).
// ============================================================================

use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::SubmoduleError;

// ----------------------------------------------------------------------------
// Capabilities
// ----------------------------------------------------------------------------

/// Name of something a submodule provides and others may depend on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Capability(Cow<'static, str>);

impl Capability {
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capabilities known to the engine
pub mod capabilities {
    use super::Capability;

    pub const COLLECTOR_HANDLER: Capability = Capability::from_static("collector-handler");
    pub const PROBING: Capability = Capability::from_static("link-probing");
    pub const SAMPLING: Capability = Capability::from_static("link-sampling");
    /// Provided from outside the engine by the topology collaborator
    pub const TOPOLOGY: Capability = Capability::from_static("topology");
}

// ----------------------------------------------------------------------------
// Lifecycle State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Started,
}

impl LifecycleState {
    /// Move to `next` if it is the immediate successor. States never regress.
    pub fn advance_to(&mut self, next: LifecycleState) -> bool {
        let allowed = matches!(
            (*self, next),
            (LifecycleState::Uninitialized, LifecycleState::Initialized)
                | (LifecycleState::Initialized, LifecycleState::Started)
        );
        if allowed {
            *self = next;
        }
        allowed
    }
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Uninitialized => write!(f, "uninitialized"),
            LifecycleState::Initialized => write!(f, "initialized"),
            LifecycleState::Started => write!(f, "started"),
        }
    }
}

// ----------------------------------------------------------------------------
// Submodule Context
// ----------------------------------------------------------------------------

type Service = Arc<dyn Any + Send + Sync>;

/// Shared context handed to every submodule during composition: the engine
/// configuration, the services registered so far, the shutdown token and
/// the background tasks started so far.
pub struct SubmoduleContext {
    config: Arc<EngineConfig>,
    services: HashMap<Capability, Service>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for SubmoduleContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.services.keys().map(Capability::as_str).collect();
        names.sort_unstable();
        f.debug_struct("SubmoduleContext")
            .field("services", &names)
            .field("shutdown", &self.shutdown.is_cancelled())
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}

impl SubmoduleContext {
    pub fn new(config: Arc<EngineConfig>, shutdown: CancellationToken) -> Self {
        Self {
            config,
            services: HashMap::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register the implementation of `capability`. Returns false (and keeps
    /// the first one) if it was already registered.
    pub fn provide<T: Any + Send + Sync>(&mut self, capability: Capability, service: Arc<T>) -> bool {
        if self.services.contains_key(&capability) {
            return false;
        }
        self.services.insert(capability, service);
        true
    }

    pub fn has(&self, capability: &Capability) -> bool {
        self.services.contains_key(capability)
    }

    /// Look up the implementation registered for `capability`.
    pub fn service<T: Any + Send + Sync>(&self, capability: &Capability) -> Result<Arc<T>, SubmoduleError> {
        let service = self
            .services
            .get(capability)
            .cloned()
            .ok_or_else(|| SubmoduleError::MissingService {
                capability: capability.clone(),
            })?;
        service.downcast::<T>().map_err(|_| SubmoduleError::ServiceTypeMismatch {
            capability: capability.clone(),
        })
    }

    /// A token cancelled when the engine shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Hand a background loop to the engine, which waits for it on shutdown.
    /// The loop must stop once its shutdown token fires.
    pub fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    pub fn take_tasks(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(self.tasks.get_mut())
    }
}

// ----------------------------------------------------------------------------
// Submodule Trait
// ----------------------------------------------------------------------------

/// A cooperating component hosted by the orchestrator.
#[async_trait]
pub trait Submodule: Send + Sync + fmt::Debug {
    /// Unique name, used in logs and errors
    fn name(&self) -> &str;

    /// The capability this submodule registers during `init`, if any
    fn provided_capability(&self) -> Option<Capability> {
        None
    }

    /// Capabilities that must be addressable before `init` runs
    fn dependencies(&self) -> Vec<Capability> {
        Vec::new()
    }

    /// Make the provided capability addressable. Must not start any activity.
    async fn init(&mut self, ctx: &mut SubmoduleContext) -> Result<(), SubmoduleError>;

    /// Begin operating. Every submodule is initialized when this is called.
    async fn start_up(&mut self, ctx: &SubmoduleContext) -> Result<(), SubmoduleError>;
}
