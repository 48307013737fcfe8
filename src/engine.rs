// ============================================================================
// MONITORING ENGINE
// ============================================================================
// Composition root. Builds the fixed submodule order
//
//   collector-handler -> link-probing -> link-sampling
//
// registers the externally provided capabilities, runs the orchestrator and
// hands out the facade the rest of the controller talks to.
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prometheus::Registry;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::control::ControlSurface;
use crate::error::{MonitorError, MonitorResult};
use crate::facade::{FlowMonitor, MonitoringFacade};
use crate::handler::{CollectorHandler, CollectorHandlerModule};
use crate::lifecycle::{capabilities, LifecycleState, SubmoduleContext};
use crate::metrics::{render_text, CorrelatorMetrics};
use crate::orchestrator::{SubmoduleDescriptor, SubmoduleOrchestrator};
use crate::probing::{LinkProbingModule, ProbingService};
use crate::sampling::{LinkSamplingModule, SamplingService};
use crate::topology::TopologyFeed;
use crate::transport::{Dispatcher, ReplyMessage};
use crate::types::Timestamp;
use crate::{DISPATCH_QUEUE_CAPACITY, ENGINE_VERSION};

/// The composed engine
pub struct MonitoringEngine {
    config: Arc<EngineConfig>,
    orchestrator: SubmoduleOrchestrator,
    registry: Registry,
    handler: Arc<CollectorHandler>,
    probing: Arc<ProbingService>,
    sampling: Arc<SamplingService>,
    facade: MonitoringFacade,
    topology: Arc<TopologyFeed>,
    replies: mpsc::Sender<ReplyMessage>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    start_time: Timestamp,
}

impl MonitoringEngine {
    /// Compose and start every submodule. Any failure aborts startup and
    /// leaves nothing running.
    pub async fn compose(
        config: EngineConfig,
        dispatcher: Arc<dyn Dispatcher>,
        topology: Arc<TopologyFeed>,
        registry: Registry,
    ) -> MonitorResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        info!(
            target: "flowwatch::init",
            version = ENGINE_VERSION,
            instance = %config.engine.instance_name,
            "Composing monitoring engine"
        );

        let metrics = CorrelatorMetrics::new(&registry)
            .map_err(|e| MonitorError::Internal(format!("metrics registration failed: {}", e)))?;
        let (replies, reply_rx) = mpsc::channel(DISPATCH_QUEUE_CAPACITY);

        let mut orchestrator = SubmoduleOrchestrator::new()
            .with(CollectorHandlerModule::new(dispatcher, metrics, reply_rx))
            .with(LinkProbingModule::new())
            .with(LinkSamplingModule::new());

        let shutdown = CancellationToken::new();
        let mut ctx = SubmoduleContext::new(Arc::clone(&config), shutdown.clone());
        ctx.provide(capabilities::TOPOLOGY, Arc::clone(&topology));

        if let Err(e) = orchestrator.compose(&mut ctx).await {
            shutdown.cancel();
            return Err(e.into());
        }

        let lookup = |e: crate::error::SubmoduleError| MonitorError::Internal(e.to_string());
        let handler = ctx
            .service::<CollectorHandler>(&capabilities::COLLECTOR_HANDLER)
            .map_err(lookup)?;
        let probing = ctx
            .service::<ProbingService>(&capabilities::PROBING)
            .map_err(lookup)?;
        let sampling = ctx
            .service::<SamplingService>(&capabilities::SAMPLING)
            .map_err(lookup)?;

        let tasks = ctx.take_tasks();

        // Sampling first: it owns every flow outside the probe base flow.
        let facade = MonitoringFacade::new(vec![
            Arc::clone(&sampling) as Arc<dyn FlowMonitor>,
            Arc::clone(&probing) as Arc<dyn FlowMonitor>,
        ]);

        info!(
            target: "flowwatch::init",
            submodules = orchestrator.len(),
            background_tasks = tasks.len(),
            "Monitoring engine started"
        );

        Ok(Self {
            config,
            orchestrator,
            registry,
            handler,
            probing,
            sampling,
            facade,
            topology,
            replies,
            shutdown,
            tasks: Mutex::new(tasks),
            start_time: Timestamp::now(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn facade(&self) -> &MonitoringFacade {
        &self.facade
    }

    pub fn control_surface(&self) -> ControlSurface {
        ControlSurface::new(self.facade.clone())
    }

    pub fn handler(&self) -> &Arc<CollectorHandler> {
        &self.handler
    }

    pub fn probing(&self) -> &Arc<ProbingService> {
        &self.probing
    }

    pub fn sampling(&self) -> &Arc<SamplingService> {
        &self.sampling
    }

    pub fn topology(&self) -> &Arc<TopologyFeed> {
        &self.topology
    }

    /// Where the agent listener pushes collector replies.
    pub fn reply_sender(&self) -> mpsc::Sender<ReplyMessage> {
        self.replies.clone()
    }

    pub fn submodules(&self) -> Vec<SubmoduleDescriptor> {
        self.orchestrator.descriptors()
    }

    pub fn state_of(&self, submodule: &str) -> Option<LifecycleState> {
        self.orchestrator.state_of(submodule)
    }

    /// Metrics registry rendered in the Prometheus text format.
    pub fn metrics_text(&self) -> String {
        render_text(&self.registry)
    }

    pub fn uptime(&self) -> Duration {
        Timestamp::now().duration_since(self.start_time)
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stop the background loops and withdraw every outstanding request.
    /// Waits up to `engine.shutdown_timeout` for the loops to exit and aborts
    /// the ones still running after that. Returns true if every loop stopped
    /// on its own. Lifecycle states stay at `Started`.
    pub async fn shutdown(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return true;
        }
        info!(target: "flowwatch::init", "Shutting down monitoring engine");
        let started = Instant::now();
        self.shutdown.cancel();
        let cancelled = self.handler.correlator().cancel_all();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let timeout = self.config.engine.shutdown_timeout;
        let clean = tokio::time::timeout(timeout, futures::future::join_all(tasks))
            .await
            .is_ok();
        if !clean {
            warn!(
                target: "flowwatch::init",
                timeout_ms = timeout.as_millis() as u64,
                "Background loops outlived the shutdown timeout, aborting them"
            );
            aborts.iter().for_each(|task| task.abort());
        }

        info!(
            target: "flowwatch::init",
            cancelled,
            clean,
            duration_ms = started.elapsed().as_millis() as u64,
            uptime_secs = self.uptime().as_secs(),
            "Monitoring engine stopped"
        );
        clean
    }

    pub fn stats(&self) -> EngineStats {
        let mut monitored: BTreeMap<String, usize> = BTreeMap::new();
        for (capability, _) in self.facade.monitored_flows() {
            *monitored.entry(capability.to_string()).or_default() += 1;
        }
        EngineStats {
            uptime: self.uptime(),
            is_running: self.is_running(),
            outstanding_requests: self.handler.correlator().outstanding_count(),
            connected_agents: self.handler.registry().agent_count(),
            known_links: self.topology.links().len(),
            monitored_flows: monitored,
        }
    }
}

impl fmt::Debug for MonitoringEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoringEngine")
            .field("instance", &self.config.engine.instance_name)
            .field("submodules", &self.orchestrator)
            .field("facade", &self.facade)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
    pub is_running: bool,
    pub outstanding_requests: usize,
    pub connected_agents: usize,
    pub known_links: usize,
    pub monitored_flows: BTreeMap<String, usize>,
}

// ============================================================================
// TESTS
// ============================================================================
