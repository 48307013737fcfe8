// ============================================================================
// COLLECTOR HANDLER
// ============================================================================
// Entry point for one-shot measurement requests. Combines the collector
// registry (may this link be measured?) with the request correlator (who is
// waiting for what?) and the transport dispatcher (send it).
// ============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::CollectorHandlerConfig;
use crate::correlator::{Delivery, PendingResult, RequestCorrelator};
use crate::error::{CollectionError, CollectorError, ConfigError, SubmoduleError};
use crate::lifecycle::{capabilities, Capability, Submodule, SubmoduleContext};
use crate::metrics::{CorrelatorMetrics, RequestOutcome};
use crate::registry::CollectorRegistry;
use crate::sample::{AgentReply, SecureProbingSample, TrajectorySample};
use crate::transport::{spawn_reply_intake, CollectionRequest, Dispatcher, ReplyMessage};
use crate::types::{
    BitMatch, CollectorId, DatapathLink, EndpointSide, FlowedLink, MeasurementTarget, NodeId,
    PortId, RequestKind, Timestamp,
};

/// Abort reason for requests whose collector went away
const DISCONNECTED_COLLECTOR: &str = "disconnected collector";
const UNREACHABLE_COLLECTOR: &str = "unreachable collector";
const COLLECTOR_LEFT: &str = "collector left before dispatch";

// ----------------------------------------------------------------------------
// Collector Handler
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct CollectorHandler {
    config: CollectorHandlerConfig,
    registry: CollectorRegistry,
    correlator: RequestCorrelator,
    dispatcher: Arc<dyn Dispatcher>,
}

impl CollectorHandler {
    pub fn new(
        config: CollectorHandlerConfig,
        dispatcher: Arc<dyn Dispatcher>,
        metrics: CorrelatorMetrics,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            correlator: RequestCorrelator::new(config.deadline_margin, metrics),
            registry: CollectorRegistry::new(),
            config,
            dispatcher,
        })
    }

    pub fn registry(&self) -> &CollectorRegistry {
        &self.registry
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    // ------------------------------------------------------------------------
    // Collector membership
    // ------------------------------------------------------------------------

    pub fn has_collector(&self, node: NodeId) -> bool {
        self.registry.has_collector(node)
    }

    pub fn has_necessary_collectors(&self, link: &DatapathLink) -> bool {
        self.registry.has_necessary_collectors(link)
    }

    pub fn connect_collector(
        &self,
        id: CollectorId,
        nodes: impl IntoIterator<Item = NodeId>,
    ) -> Result<(), CollectorError> {
        self.registry.connect(id, nodes)
    }

    /// Remove the agent and abort every outstanding request on its nodes.
    /// Returns how many requests were aborted.
    pub fn disconnect_collector(&self, id: &CollectorId) -> Result<usize, CollectorError> {
        let nodes: BTreeSet<NodeId> = self.registry.disconnect(id)?;
        let nodes: Vec<NodeId> = nodes.into_iter().collect();
        let aborted = self.correlator.abort_touching(&nodes, DISCONNECTED_COLLECTOR);
        if aborted > 0 {
            warn!(
                target: "flowwatch::collectors",
                collector = %id,
                aborted,
                "Aborted outstanding requests of disconnected collector"
            );
        }
        Ok(aborted)
    }

    /// Apply a reachability change pushed by the membership feed.
    pub fn set_reachable(&self, node: NodeId, reachable: bool) {
        if self.registry.set_reachable(node, reachable) && !reachable {
            self.correlator.abort_touching(&[node], UNREACHABLE_COLLECTOR);
        }
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Ask the collectors of `flowed.link` to sample `flowed.flow` for
    /// `duration`.
    pub fn send_sampling_request(
        &self,
        flowed: FlowedLink,
        duration: Duration,
    ) -> Result<PendingResult<TrajectorySample>, CollectionError> {
        let pending = self.send(MeasurementTarget::Flowed(flowed), RequestKind::Sampling, duration)?;
        Ok(pending.typed())
    }

    /// Ask the collectors of `link` to watch for probes matching `bit_match`.
    pub fn send_probing_request(
        &self,
        bit_match: BitMatch,
        link: DatapathLink,
        duration: Duration,
    ) -> Result<PendingResult<SecureProbingSample>, CollectionError> {
        let pending = self.send(MeasurementTarget::Probe { link, bit_match }, RequestKind::Probing, duration)?;
        Ok(pending.typed())
    }

    fn send(
        &self,
        target: MeasurementTarget,
        kind: RequestKind,
        duration: Duration,
    ) -> Result<PendingResult, CollectionError> {
        let link = *target.link();
        if let Some(side) = self.missing_side(&link) {
            self.correlator.metrics().record(kind, RequestOutcome::MissingCollector);
            return Err(CollectionError::MissingCollector {
                node: link.endpoint(side).node,
                side,
            });
        }

        let pending = self.correlator.register(target, kind, duration)?;
        if !self.ensure_collectors(&pending, &link) {
            return Ok(pending);
        }
        let request = CollectionRequest {
            request_id: pending.request_id(),
            key: pending.key().clone(),
            duration,
            sampling_port: (kind == RequestKind::Sampling).then(|| self.sampling_port()),
            source_collector: self.collector_of(link.src_node()),
            destination_collector: self.collector_of(link.dest_node()),
            issued_at: Timestamp::now(),
        };

        if let Err(e) = self.dispatcher.dispatch(&request) {
            warn!(
                target: "flowwatch::collectors",
                key = %request.key,
                error = %e,
                "Failed to dispatch collection request"
            );
            self.correlator
                .fail_request(&request.key, request.request_id, CollectionError::Dispatch(e));
        }
        Ok(pending)
    }

    /// A collector leaving between the membership check and `register` is
    /// missed by `abort_touching`, so the check is repeated once the request
    /// is visible. Fails the handle and returns false if a side is gone.
    fn ensure_collectors(&self, pending: &PendingResult, link: &DatapathLink) -> bool {
        let Some(side) = self.missing_side(link) else {
            return true;
        };
        warn!(
            target: "flowwatch::collectors",
            key = %pending.key(),
            side = %side,
            "Collector left while the request was being registered"
        );
        self.correlator.fail_request(
            pending.key(),
            pending.request_id(),
            CollectionError::aborted(COLLECTOR_LEFT),
        );
        false
    }

    fn missing_side(&self, link: &DatapathLink) -> Option<EndpointSide> {
        [EndpointSide::Source, EndpointSide::Destination]
            .into_iter()
            .find(|side| !self.has_collector(link.endpoint(*side).node))
    }

    fn collector_of(&self, node: NodeId) -> Option<CollectorId> {
        self.registry.entry(node).and_then(|e| e.collector)
    }

    /// Route one collector's half-reply to the correlator.
    pub fn deliver_reply(&self, reply: AgentReply) -> Delivery {
        self.correlator.deliver_endpoint_reply(reply)
    }

    pub fn sampling_port(&self) -> PortId {
        PortId(self.config.sampling_port)
    }

    pub fn local_port(&self) -> u16 {
        self.config.local_port
    }

    /// True while a request for the key is outstanding.
    pub fn request_in_flight(&self, target: &MeasurementTarget, kind: RequestKind) -> bool {
        self.correlator.is_outstanding(target, kind)
    }
}

// ----------------------------------------------------------------------------
// Submodule
// ----------------------------------------------------------------------------

/// Hosts the collector handler in the orchestrator. `init` registers the
/// handler as a service; `start_up` begins draining agent replies.
#[derive(Debug)]
pub struct CollectorHandlerModule {
    dispatcher: Arc<dyn Dispatcher>,
    metrics: Option<CorrelatorMetrics>,
    replies: Option<mpsc::Receiver<ReplyMessage>>,
    handler: Option<Arc<CollectorHandler>>,
}

impl CollectorHandlerModule {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        metrics: CorrelatorMetrics,
        replies: mpsc::Receiver<ReplyMessage>,
    ) -> Self {
        Self {
            dispatcher,
            metrics: Some(metrics),
            replies: Some(replies),
            handler: None,
        }
    }

    pub fn handler(&self) -> Option<Arc<CollectorHandler>> {
        self.handler.clone()
    }
}

#[async_trait]
impl Submodule for CollectorHandlerModule {
    fn name(&self) -> &str {
        "collector-handler"
    }

    fn provided_capability(&self) -> Option<Capability> {
        Some(capabilities::COLLECTOR_HANDLER)
    }

    async fn init(&mut self, ctx: &mut SubmoduleContext) -> Result<(), SubmoduleError> {
        let metrics = self
            .metrics
            .take()
            .ok_or_else(|| SubmoduleError::failed("collector handler initialized twice"))?;
        let handler = Arc::new(CollectorHandler::new(
            ctx.config().collector_handler.clone(),
            Arc::clone(&self.dispatcher),
            metrics,
        )?);
        ctx.provide(capabilities::COLLECTOR_HANDLER, Arc::clone(&handler));
        self.handler = Some(handler);
        Ok(())
    }

    async fn start_up(&mut self, ctx: &SubmoduleContext) -> Result<(), SubmoduleError> {
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| SubmoduleError::failed("collector handler was not initialized"))?;
        let replies = self
            .replies
            .take()
            .ok_or_else(|| SubmoduleError::failed("collector handler already started"))?;

        ctx.track(spawn_reply_intake(replies, Arc::clone(&handler), ctx.shutdown_token()));
        info!(
            target: "flowwatch::collectors",
            local_port = handler.local_port(),
            sampling_port = %handler.sampling_port(),
            "Collector handler started"
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
    use crate::error::DispatchError;
    use crate::sample::{ReplyPayload, TimedPacketSummary};
    use crate::transport::ChannelDispatcher;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    /// Dispatcher that records requests, or rejects them all.
    #[derive(Debug, Default)]
    struct RecordingDispatcher {
        sent: Mutex<Vec<CollectionRequest>>,
        reject: bool,
    }

    impl Dispatcher for RecordingDispatcher {
        fn dispatch(&self, request: &CollectionRequest) -> Result<(), DispatchError> {
            if self.reject {
                return Err(DispatchError::Rejected {
                    reason: "link down".into(),
                });
            }
            self.sent.lock().push(request.clone());
            Ok(())
        }
    }

    fn handler_with(dispatcher: Arc<dyn Dispatcher>) -> CollectorHandler {
        CollectorHandler::new(
            CollectorHandlerConfig::default(),
            dispatcher,
            CorrelatorMetrics::unregistered().unwrap(),
        )
        .unwrap()
    }

    fn flowed() -> FlowedLink {
        "1[1]>2[1]@eth_type=0x0800".parse().unwrap()
    }

    #[tokio::test]
    async fn test_missing_collector_rejects_without_registering() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let handler = handler_with(dispatcher.clone());
        handler.set_reachable(NodeId(1), true);
        handler.set_reachable(NodeId(2), true);
        assert!(handler.has_necessary_collectors(&flowed().link));

        handler.set_reachable(NodeId(2), false);
        assert!(!handler.has_necessary_collectors(&flowed().link));

        let err = handler
            .send_sampling_request(flowed(), Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(
            err,
            CollectionError::MissingCollector {
                node: NodeId(2),
                side: EndpointSide::Destination
            }
        );
        assert_eq!(handler.correlator().outstanding_count(), 0);
        assert!(dispatcher.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sampling_request_is_dispatched_with_sampling_port() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let handler = handler_with(dispatcher.clone());
        handler
            .connect_collector(CollectorId::new("a"), [NodeId(1), NodeId(2)])
            .unwrap();

        let pending = handler
            .send_sampling_request(flowed(), Duration::from_secs(1))
            .unwrap();

        let sent = dispatcher.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].request_id, pending.request_id());
        assert_eq!(sent[0].sampling_port, Some(PortId(65000)));
        assert_eq!(sent[0].source_collector, Some(CollectorId::new("a")));
        assert!(handler.request_in_flight(&MeasurementTarget::Flowed(flowed()), RequestKind::Sampling));
    }

    #[tokio::test]
    async fn test_dispatch_failure_fails_the_handle() {
        let dispatcher = Arc::new(RecordingDispatcher {
            reject: true,
            ..Default::default()
        });
        let handler = handler_with(dispatcher);
        handler.set_reachable(NodeId(1), true);
        handler.set_reachable(NodeId(2), true);

        let link: DatapathLink = "1[1]>2[1]".parse().unwrap();
        let pending = handler
            .send_probing_request(BitMatch::new(3, 0xff), link, Duration::from_secs(2))
            .unwrap();

        assert_eq!(handler.correlator().outstanding_count(), 0);
        assert!(matches!(pending.await, Err(CollectionError::Dispatch(DispatchError::Rejected { .. }))));
    }

    #[tokio::test]
    async fn test_request_registered_after_collector_left_is_aborted() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let handler = handler_with(dispatcher.clone());
        let a = CollectorId::new("a");
        handler.connect_collector(a.clone(), [NodeId(1), NodeId(2)]).unwrap();
        let link: DatapathLink = "1[1]>2[1]".parse().unwrap();
        let target = MeasurementTarget::Probe {
            link,
            bit_match: BitMatch::new(7, 0xff),
        };

        // Disconnect lands after the membership check, before registration.
        assert_eq!(handler.disconnect_collector(&a).unwrap(), 0);
        let pending = handler
            .correlator()
            .register(target.clone(), RequestKind::Probing, Duration::from_secs(5))
            .unwrap();

        assert!(!handler.ensure_collectors(&pending, &link));
        assert!(!handler.request_in_flight(&target, RequestKind::Probing));
        assert_eq!(pending.await, Err(CollectionError::aborted(COLLECTOR_LEFT)));
        assert!(dispatcher.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_aborts_outstanding_requests() {
        let (dispatcher, _rx) = ChannelDispatcher::new(16);
        let handler = handler_with(Arc::new(dispatcher));
        let a = CollectorId::new("a");
        handler.connect_collector(a.clone(), [NodeId(1)]).unwrap();
        handler.connect_collector(CollectorId::new("b"), [NodeId(2)]).unwrap();

        let pending = handler
            .send_sampling_request(flowed(), Duration::from_secs(5))
            .unwrap();
        assert_eq!(handler.disconnect_collector(&a).unwrap(), 1);
        assert_eq!(
            pending.await,
            Err(CollectionError::aborted("disconnected collector"))
        );
        assert!(!handler.has_collector(NodeId(1)));
    }

    #[tokio::test]
    async fn test_probing_replies_resolve_through_handler() {
        let (dispatcher, _rx) = ChannelDispatcher::new(16);
        let handler = handler_with(Arc::new(dispatcher));
        handler.set_reachable(NodeId(1), true);
        handler.set_reachable(NodeId(2), true);

        let link: DatapathLink = "1[1]>2[1]".parse().unwrap();
        let bit_match = BitMatch::new(0x42, 0xff);
        let pending = handler
            .send_probing_request(bit_match, link, Duration::from_secs(1))
            .unwrap();
        let target = MeasurementTarget::Probe { link, bit_match };

        for side in [EndpointSide::Source, EndpointSide::Destination] {
            handler.deliver_reply(AgentReply {
                collector: CollectorId::new("a"),
                endpoint: target.endpoint(side),
                finished_at: Timestamp::from_millis(5),
                payload: ReplyPayload::Probe(Some(TimedPacketSummary::new(1, 64, Timestamp::from_millis(5)))),
            });
        }

        let sample = pending.await.unwrap();
        assert_eq!(sample.link, link);
        assert_eq!(sample.results.unwrap().bit_match, bit_match);
    }

    #[test]
    fn test_sampling_port_accessor() {
        let (dispatcher, _rx) = ChannelDispatcher::new(1);
        let handler = handler_with(Arc::new(dispatcher));
        assert_eq!(handler.sampling_port(), PortId(65000));
        assert_eq!(handler.local_port(), 32800);
    }
}
