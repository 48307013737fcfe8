// ============================================================================
// LINK PROBING
// ============================================================================
// Active measurement: every round, each known link whose endpoints both have
// a collector is probed with packets tagged by a fresh bit pattern. Probe
// packets carry the probe ethertype, so only flows inside the probe base
// flow can be monitored here.
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
use tracing::{debug, info};

use crate::config::ProbingConfig;
use crate::error::{CollectionError, SubmoduleError, ValidationError};
use crate::facade::FlowMonitor;
use crate::handler::CollectorHandler;
use crate::lifecycle::{capabilities, Capability, Submodule, SubmoduleContext};
use crate::sample::SecureProbingSample;
use crate::topology::{LinkSet, TopologyFeed};
use crate::types::{BitMatch, DatapathLink, Flow};
use crate::EVENT_CHANNEL_CAPACITY;

// ----------------------------------------------------------------------------
// Probing Service
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct ProbingService {
    config: ProbingConfig,
    base_flow: Flow,
    handler: Arc<CollectorHandler>,
    flows: Mutex<HashSet<Flow>>,
    links: Arc<LinkSet>,
    samples: broadcast::Sender<SecureProbingSample>,
    latest: DashMap<DatapathLink, SecureProbingSample>,
}

impl ProbingService {
    pub fn new(config: ProbingConfig, handler: Arc<CollectorHandler>) -> Self {
        let (samples, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            base_flow: config.probe_base_flow(),
            config,
            handler,
            flows: Mutex::new(HashSet::new()),
            links: Arc::new(LinkSet::new()),
            samples,
            latest: DashMap::new(),
        }
    }

    /// The flow matching every secure probe packet.
    pub fn probe_base_flow(&self) -> &Flow {
        &self.base_flow
    }

    pub fn links(&self) -> &Arc<LinkSet> {
        &self.links
    }

    // ------------------------------------------------------------------------
    // Monitored flows
    // ------------------------------------------------------------------------

    pub fn validate_probable_flow(&self, flow: &Flow) -> Result<(), ValidationError> {
        if self.base_flow.contains(flow) {
            Ok(())
        } else {
            Err(ValidationError::NotProbable {
                reason: format!("flow {} is not within the probe base flow {}", flow, self.base_flow),
            })
        }
    }

    pub fn is_valid_probable_flow(&self, flow: &Flow) -> bool {
        self.validate_probable_flow(flow).is_ok()
    }

    /// Returns true only if the flow was not already being probed.
    pub fn start_probing(&self, flow: &Flow) -> Result<bool, ValidationError> {
        self.validate_probable_flow(flow)?;
        let started = self.flows.lock().insert(flow.clone());
        if started {
            info!(target: "flowwatch::probing", flow = %flow, "Started probing flow");
        }
        Ok(started)
    }

    /// Returns true only if the flow was being probed.
    pub fn stop_probing(&self, flow: &Flow) -> Result<bool, ValidationError> {
        self.validate_probable_flow(flow)?;
        let stopped = self.flows.lock().remove(flow);
        if stopped {
            info!(target: "flowwatch::probing", flow = %flow, "Stopped probing flow");
        }
        Ok(stopped)
    }

    pub fn is_probing(&self, flow: &Flow) -> bool {
        self.flows.lock().contains(flow)
    }

    pub fn probed_flows(&self) -> Vec<Flow> {
        let mut flows: Vec<Flow> = self.flows.lock().iter().cloned().collect();
        flows.sort();
        flows
    }

    // ------------------------------------------------------------------------
    // Samples
    // ------------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<SecureProbingSample> {
        self.samples.subscribe()
    }

    pub fn latest_sample(&self, link: &DatapathLink) -> Option<SecureProbingSample> {
        self.latest.get(link).map(|s| s.clone())
    }

    fn forget_link(&self, link: &DatapathLink) {
        self.latest.remove(link);
    }

    fn publish(&self, sample: SecureProbingSample) {
        self.latest.insert(sample.link, sample.clone());
        // Nobody listening is not an error.
        let _ = self.samples.send(sample);
    }

    // ------------------------------------------------------------------------
    // Rounds
    // ------------------------------------------------------------------------

    /// Links that can be probed right now.
    pub fn probe_targets(&self) -> Vec<DatapathLink> {
        if self.flows.lock().is_empty() {
            return Vec::new();
        }
        self.links
            .snapshot()
            .into_iter()
            .filter(|link| self.handler.has_necessary_collectors(link))
            .collect()
    }

    /// Probe one link for `duration` and publish the outcome.
    pub async fn probe_link(
        &self,
        link: DatapathLink,
        duration: Duration,
    ) -> Result<SecureProbingSample, CollectionError> {
        let pending = self
            .handler
            .send_probing_request(BitMatch::random(), link, duration)?;
        match pending.await {
            Ok(sample) => {
                self.publish(sample.clone());
                Ok(sample)
            }
            Err(e) => {
                debug!(target: "flowwatch::probing", link = %link, error = %e, "Probing produced no results");
                self.publish(SecureProbingSample::no_results(link));
                Err(e)
            }
        }
    }

    /// Probe every target once, at most `max_simultaneous_probings` at a time.
    /// Returns how many probes produced results.
    pub async fn run_round(&self, duration: Duration) -> usize {
        let targets = self.probe_targets();
        let limit = self.config.max_simultaneous_probings.max(1);
        stream::iter(targets)
            .map(|link| self.probe_link(link, duration))
            .buffer_unordered(limit)
            .filter(|outcome| futures::future::ready(outcome.is_ok()))
            .count()
            .await
    }

    /// Round loop; idles while there is nothing to probe.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(target: "flowwatch::probing", "Probing loop started");
        loop {
            let wait = if self.probe_targets().is_empty() {
                self.config.idle_sleep
            } else {
                let duration = self.config.round_duration();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    probed = self.run_round(duration) => {
                        debug!(target: "flowwatch::probing", probed, round_ms = duration.as_millis() as u64, "Probing round finished");
                    }
                }
                Duration::ZERO
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!(target: "flowwatch::probing", "Probing loop stopped");
    }
}

impl FlowMonitor for ProbingService {
    fn capability(&self) -> Capability {
        capabilities::PROBING
    }

    fn validate_flow(&self, flow: &Flow) -> Result<(), ValidationError> {
        self.validate_probable_flow(flow)
    }

    fn start_monitoring(&self, flow: &Flow) -> Result<bool, ValidationError> {
        self.start_probing(flow)
    }

    fn stop_monitoring(&self, flow: &Flow) -> Result<bool, ValidationError> {
        self.stop_probing(flow)
    }

    fn is_monitoring(&self, flow: &Flow) -> bool {
        self.is_probing(flow)
    }

    fn monitored_flows(&self) -> Vec<Flow> {
        self.probed_flows()
    }
}

// ----------------------------------------------------------------------------
// Submodule
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct LinkProbingModule {
    service: Option<Arc<ProbingService>>,
}

impl LinkProbingModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(&self) -> Option<Arc<ProbingService>> {
        self.service.clone()
    }
}

#[async_trait]
impl Submodule for LinkProbingModule {
    fn name(&self) -> &str {
        "link-probing"
    }

    fn provided_capability(&self) -> Option<Capability> {
        Some(capabilities::PROBING)
    }

    fn dependencies(&self) -> Vec<Capability> {
        vec![capabilities::COLLECTOR_HANDLER, capabilities::TOPOLOGY]
    }

    async fn init(&mut self, ctx: &mut SubmoduleContext) -> Result<(), SubmoduleError> {
        let handler = ctx.service::<CollectorHandler>(&capabilities::COLLECTOR_HANDLER)?;
        let service = Arc::new(ProbingService::new(ctx.config().probing.clone(), handler));
        ctx.provide(capabilities::PROBING, Arc::clone(&service));
        self.service = Some(service);
        Ok(())
    }

    async fn start_up(&mut self, ctx: &SubmoduleContext) -> Result<(), SubmoduleError> {
        let service = self
            .service
            .clone()
            .ok_or_else(|| SubmoduleError::failed("link probing was not initialized"))?;
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
            target: "flowwatch::probing",
            base_flow = %service.probe_base_flow(),
            "Link probing started"
        );
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectorHandlerConfig;
    use crate::metrics::CorrelatorMetrics;
    use crate::sample::{AgentReply, ReplyPayload, TimedPacketSummary};
    use crate::transport::{ChannelDispatcher, CollectionRequest};
    use crate::types::{CollectorId, EndpointSide, MatchField, MeasurementTarget, NodeId, Timestamp};
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    fn service() -> (Arc<ProbingService>, mpsc::Receiver<CollectionRequest>) {
        let (dispatcher, rx) = ChannelDispatcher::new(64);
        let handler = Arc::new(
            CollectorHandler::new(
                CollectorHandlerConfig::default(),
                Arc::new(dispatcher),
                CorrelatorMetrics::unregistered().unwrap(),
            )
            .unwrap(),
        );
        (Arc::new(ProbingService::new(ProbingConfig::default(), handler)), rx)
    }

    #[test]
    fn test_only_flows_within_base_flow_are_probable() {
        let (service, _rx) = service();
        let probe: Flow = "eth_type=0x88b5".parse().unwrap();
        let narrower = probe.clone().with(MatchField::InPort, "3").unwrap();
        let ipv4: Flow = "eth_type=0x0800".parse().unwrap();

        assert!(service.is_valid_probable_flow(&probe));
        assert!(service.is_valid_probable_flow(&"eth_type=34997".parse().unwrap()));
        assert!(service.is_valid_probable_flow(&narrower));
        assert!(!service.is_valid_probable_flow(&ipv4));
        assert!(!service.is_valid_probable_flow(&Flow::any()));
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let (service, _rx) = service();
        let probe = service.probe_base_flow().clone();

        assert_eq!(service.start_probing(&probe), Ok(true));
        assert_eq!(service.start_probing(&probe), Ok(false));
        assert_eq!(service.probed_flows(), vec![probe.clone()]);
        assert_eq!(service.stop_probing(&probe), Ok(true));
        assert_eq!(service.stop_probing(&probe), Ok(false));
        assert!(service.start_probing(&Flow::any()).is_err());
    }

    #[tokio::test]
    async fn test_probe_targets_require_flows_and_collectors() {
        let (service, _rx) = service();
        let link: DatapathLink = "1[1]>2[1]".parse().unwrap();
        service.links().replace([link].into_iter().collect());
        assert!(service.probe_targets().is_empty());

        service.start_probing(&service.probe_base_flow().clone()).unwrap();
        assert!(service.probe_targets().is_empty());

        service.handler.set_reachable(NodeId(1), true);
        service.handler.set_reachable(NodeId(2), true);
        assert_eq!(service.probe_targets(), vec![link]);
    }

    #[tokio::test]
    async fn test_probe_link_publishes_assembled_sample() {
        let (service, mut requests) = service();
        let link: DatapathLink = "1[1]>2[1]".parse().unwrap();
        service.handler.connect_collector(CollectorId::new("a"), [NodeId(1), NodeId(2)]).unwrap();
        let mut samples = service.subscribe();

        let prober = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.probe_link(link, Duration::from_millis(100)).await })
        };

        // Play both collectors: answer whatever request goes out.
        let request = requests.recv().await.unwrap();
        let MeasurementTarget::Probe { bit_match, .. } = request.key.target.clone() else {
            panic!("expected a probe request");
        };
        for side in [EndpointSide::Source, EndpointSide::Destination] {
            service.handler.deliver_reply(AgentReply {
                collector: CollectorId::new("a"),
                endpoint: request.key.target.endpoint(side),
                finished_at: Timestamp::from_millis(1),
                payload: ReplyPayload::Probe(Some(TimedPacketSummary::new(bit_match.value, 64, Timestamp::from_millis(1)))),
            });
        }

        let sample = prober.await.unwrap().unwrap();
        assert!(sample.has_results());
        assert_eq!(samples.recv().await.unwrap(), sample);
        assert_eq!(service.latest_sample(&link), Some(sample));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probe_times_out_and_publishes_no_results() {
        let (service, _requests) = service();
        let link: DatapathLink = "1[1]>2[1]".parse().unwrap();
        service.handler.set_reachable(NodeId(1), true);
        service.handler.set_reachable(NodeId(2), true);

        let err = service.probe_link(link, Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, CollectionError::TimedOut { .. }));
        assert_eq!(service.latest_sample(&link), Some(SecureProbingSample::no_results(link)));
    }
}
