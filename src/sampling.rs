// ============================================================================
// LINK SAMPLING
// ============================================================================
// Passive measurement: every round, each monitored flow is sampled on each
// link whose endpoints both have a collector. Collectors hash the matching
// packets they see on the sampling port; the assembled trajectory tells
// which packets made it across the link.
// ============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SamplingConfig;
use crate::error::{CollectionError, SubmoduleError, ValidationError};
use crate::facade::FlowMonitor;
use crate::handler::CollectorHandler;
use crate::lifecycle::{capabilities, Capability, Submodule, SubmoduleContext};
use crate::probing::ProbingService;
use crate::sample::TrajectorySample;
use crate::topology::{LinkSet, TopologyFeed};
use crate::types::{DatapathLink, Flow, FlowedLink, MatchField};
use crate::EVENT_CHANNEL_CAPACITY;

/// Fields the switches rewrite or consume along the sampling path.
const UNSAMPLABLE_FIELDS: [MatchField; 4] = [
    MatchField::InPort,
    MatchField::Metadata,
    MatchField::VlanVid,
    MatchField::NxReg0,
];

// ----------------------------------------------------------------------------
// Sampling Service
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct SamplingService {
    config: SamplingConfig,
    probe_base_flow: Flow,
    handler: Arc<CollectorHandler>,
    flows: Mutex<HashSet<Flow>>,
    links: Arc<LinkSet>,
    samples: broadcast::Sender<TrajectorySample>,
    latest: DashMap<FlowedLink, TrajectorySample>,
}

impl SamplingService {
    pub fn new(config: SamplingConfig, probe_base_flow: Flow, handler: Arc<CollectorHandler>) -> Self {
        let (samples, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            probe_base_flow,
            handler,
            flows: Mutex::new(HashSet::new()),
            links: Arc::new(LinkSet::new()),
            samples,
            latest: DashMap::new(),
        }
    }

    pub fn links(&self) -> &Arc<LinkSet> {
        &self.links
    }

    // ------------------------------------------------------------------------
    // Monitored flows
    // ------------------------------------------------------------------------

    pub fn validate_samplable_flow(&self, flow: &Flow) -> Result<(), ValidationError> {
        if let Some(field) = UNSAMPLABLE_FIELDS.iter().find(|f| flow.constrains(**f)) {
            return Err(ValidationError::NotSamplable {
                reason: format!("flow {} must not constrain {}", flow, field),
            });
        }
        if self.probe_base_flow.contains(flow) {
            return Err(ValidationError::NotSamplable {
                reason: format!("flow {} only matches secure probe packets", flow),
            });
        }
        Ok(())
    }

    pub fn is_valid_samplable_flow(&self, flow: &Flow) -> bool {
        self.validate_samplable_flow(flow).is_ok()
    }

    /// Returns true only if the flow was not already being sampled.
    pub fn start_sampling(&self, flow: &Flow) -> Result<bool, ValidationError> {
        self.validate_samplable_flow(flow)?;
        let started = self.flows.lock().insert(flow.clone());
        if started {
            if flow.contains(&self.probe_base_flow) {
                warn!(
                    target: "flowwatch::sampling",
                    flow = %flow,
                    "Sampled flow also matches secure probe packets"
                );
            }
            info!(target: "flowwatch::sampling", flow = %flow, "Started sampling flow");
        }
        Ok(started)
    }

    /// Returns true only if the flow was being sampled.
    pub fn stop_sampling(&self, flow: &Flow) -> Result<bool, ValidationError> {
        self.validate_samplable_flow(flow)?;
        let stopped = self.flows.lock().remove(flow);
        if stopped {
            self.latest.retain(|flowed, _| &flowed.flow != flow);
            info!(target: "flowwatch::sampling", flow = %flow, "Stopped sampling flow");
        }
        Ok(stopped)
    }

    pub fn is_sampling(&self, flow: &Flow) -> bool {
        self.flows.lock().contains(flow)
    }

    pub fn sampled_flows(&self) -> Vec<Flow> {
        let mut flows: Vec<Flow> = self.flows.lock().iter().cloned().collect();
        flows.sort();
        flows
    }

    // ------------------------------------------------------------------------
    // Samples
    // ------------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<TrajectorySample> {
        self.samples.subscribe()
    }

    pub fn latest_sample(&self, flowed: &FlowedLink) -> Option<TrajectorySample> {
        self.latest.get(flowed).map(|s| s.clone())
    }

    fn forget_link(&self, link: &DatapathLink) {
        self.latest.retain(|flowed, _| &flowed.link != link);
    }

    fn publish(&self, sample: TrajectorySample) {
        self.latest.insert(sample.link.clone(), sample.clone());
        let _ = self.samples.send(sample);
    }

    // ------------------------------------------------------------------------
    // Rounds
    // ------------------------------------------------------------------------

    /// Every (link, flow) pair that can be sampled right now.
    pub fn sample_targets(&self) -> Vec<FlowedLink> {
        let flows = self.sampled_flows();
        if flows.is_empty() {
            return Vec::new();
        }
        self.links
            .snapshot()
            .into_iter()
            .filter(|link| self.handler.has_necessary_collectors(link))
            .flat_map(|link| flows.iter().map(move |flow| FlowedLink::new(link, flow.clone())))
            .collect()
    }

    pub async fn sample_link(
        &self,
        flowed: FlowedLink,
        duration: Duration,
    ) -> Result<TrajectorySample, CollectionError> {
        let pending = self.handler.send_sampling_request(flowed.clone(), duration)?;
        match pending.await {
            Ok(sample) => {
                self.publish(sample.clone());
                Ok(sample)
            }
            Err(e) => {
                debug!(target: "flowwatch::sampling", link = %flowed, error = %e, "Sampling produced no results");
                self.publish(TrajectorySample::no_results(flowed));
                Err(e)
            }
        }
    }

    /// Sample every target once, at most `max_simultaneous_samplings` at a
    /// time. Returns how many samplings produced results.
    pub async fn run_round(&self, duration: Duration) -> usize {
        let targets = self.sample_targets();
        let limit = self.config.max_simultaneous_samplings.max(1);
        stream::iter(targets)
            .map(|flowed| self.sample_link(flowed, duration))
            .buffer_unordered(limit)
            .filter(|outcome| futures::future::ready(outcome.is_ok()))
            .count()
            .await
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(target: "flowwatch::sampling", "Sampling loop started");
        loop {
            let wait = if self.sample_targets().is_empty() {
                self.config.idle_sleep
            } else {
                let duration = self.config.round_duration();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    sampled = self.run_round(duration) => {
                        debug!(target: "flowwatch::sampling", sampled, round_ms = duration.as_millis() as u64, "Sampling round finished");
                    }
                }
                Duration::ZERO
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!(target: "flowwatch::sampling", "Sampling loop stopped");
    }
}

impl FlowMonitor for SamplingService {
    fn capability(&self) -> Capability {
        capabilities::SAMPLING
    }

    fn validate_flow(&self, flow: &Flow) -> Result<(), ValidationError> {
        self.validate_samplable_flow(flow)
    }

    fn start_monitoring(&self, flow: &Flow) -> Result<bool, ValidationError> {
        self.start_sampling(flow)
    }

    fn stop_monitoring(&self, flow: &Flow) -> Result<bool, ValidationError> {
        self.stop_sampling(flow)
    }

    fn is_monitoring(&self, flow: &Flow) -> bool {
        self.is_sampling(flow)
    }

    fn monitored_flows(&self) -> Vec<Flow> {
        self.sampled_flows()
    }
}

// ----------------------------------------------------------------------------
// Submodule
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct LinkSamplingModule {
    service: Option<Arc<SamplingService>>,
}

impl LinkSamplingModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(&self) -> Option<Arc<SamplingService>> {
        self.service.clone()
    }
}

#[async_trait]
impl Submodule for LinkSamplingModule {
    fn name(&self) -> &str {
        "link-sampling"
    }

    fn provided_capability(&self) -> Option<Capability> {
        Some(capabilities::SAMPLING)
    }

    fn dependencies(&self) -> Vec<Capability> {
        vec![
            capabilities::COLLECTOR_HANDLER,
            capabilities::PROBING,
            capabilities::TOPOLOGY,
        ]
    }

    async fn init(&mut self, ctx: &mut SubmoduleContext) -> Result<(), SubmoduleError> {
        let handler = ctx.service::<CollectorHandler>(&capabilities::COLLECTOR_HANDLER)?;
        let probing = ctx.service::<ProbingService>(&capabilities::PROBING)?;
        let service = Arc::new(SamplingService::new(
            ctx.config().sampling.clone(),
            probing.probe_base_flow().clone(),
            handler,
        ));
        ctx.provide(capabilities::SAMPLING, Arc::clone(&service));
        self.service = Some(service);
        Ok(())
    }

    async fn start_up(&mut self, ctx: &SubmoduleContext) -> Result<(), SubmoduleError> {
        let service = self
            .service
            .clone()
            .ok_or_else(|| SubmoduleError::failed("link sampling was not initialized"))?;
        let topology = ctx.service::<TopologyFeed>(&capabilities::TOPOLOGY)?;

        let on_removed = {
            let service = Arc::clone(&service);
            move |link: DatapathLink| service.forget_link(&link)
        };
        ctx.track(
            service
                .links()
                .spawn_follower(topology, ctx.shutdown_token(), on_removed),
        );
        ctx.track(tokio::spawn(Arc::clone(&service).run(ctx.shutdown_token())));

        info!(
            target: "flowwatch::sampling",
            sampling_port = %service.handler.sampling_port(),
            "Link sampling started"
        );
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
