// ============================================================================
// TRANSPORT BOUNDARY
// ============================================================================
// The engine does not know how a request reaches a collector agent, nor how
// a reply is parsed. Requests leave through a `Dispatcher`; replies come back
// through an mpsc queue drained by `spawn_reply_intake`.
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::handler::CollectorHandler;
use crate::sample::{AgentReply, Sample};
use crate::types::{CollectorId, CorrelationKey, MeasurementTarget, PortId, RequestKind, Timestamp};

// ----------------------------------------------------------------------------
// Outgoing Requests
// ----------------------------------------------------------------------------

/// Everything a transport needs to ask both collectors of a link to measure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionRequest {
    pub request_id: Uuid,
    pub key: CorrelationKey,
    pub duration: Duration,
    /// Port that mirrors sampled packets toward the collectors
    pub sampling_port: Option<PortId>,
    pub source_collector: Option<CollectorId>,
    pub destination_collector: Option<CollectorId>,
    pub issued_at: Timestamp,
}

impl CollectionRequest {
    pub fn kind(&self) -> RequestKind {
        self.key.kind
    }

    pub fn target(&self) -> &MeasurementTarget {
        &self.key.target
    }
}

/// Hands requests to whatever reaches the collector agents. Must not block.
pub trait Dispatcher: Send + Sync + fmt::Debug {
    fn dispatch(&self, request: &CollectionRequest) -> Result<(), DispatchError>;
}

/// Dispatcher that enqueues requests on a bounded channel for a transport
/// task to drain.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<CollectionRequest>,
}

impl ChannelDispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<CollectionRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl Dispatcher for ChannelDispatcher {
    fn dispatch(&self, request: &CollectionRequest) -> Result<(), DispatchError> {
        self.tx.try_send(request.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }
}

// ----------------------------------------------------------------------------
// Incoming Replies
// ----------------------------------------------------------------------------

/// A reply delivered by the agent listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyMessage {
    /// One collector's half of a measurement.
    Endpoint(AgentReply),
    /// A sample already assembled by the listener.
    Complete {
        target: MeasurementTarget,
        kind: RequestKind,
        sample: Sample,
    },
}

impl From<AgentReply> for ReplyMessage {
    fn from(reply: AgentReply) -> Self {
        ReplyMessage::Endpoint(reply)
    }
}

/// Drain `rx` into the handler until the channel closes or `shutdown` fires.
pub fn spawn_reply_intake(
    mut rx: mpsc::Receiver<ReplyMessage>,
    handler: Arc<CollectorHandler>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(target: "flowwatch::collectors", "Reply intake started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    match message {
                        ReplyMessage::Endpoint(reply) => {
                            let outcome = handler.deliver_reply(reply);
                            debug!(target: "flowwatch::collectors", ?outcome, "Endpoint reply delivered");
                        }
                        ReplyMessage::Complete { target, kind, sample } => {
                            handler.correlator().resolve(&target, kind, sample);
                        }
                    }
                }
            }
        }
        info!(target: "flowwatch::collectors", "Reply intake stopped");
    })
}
