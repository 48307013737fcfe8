// ============================================================================
// REQUEST CORRELATOR
// ============================================================================
// Tracks outstanding measurement requests and matches each asynchronous agent
// reply to the request that triggered it.
//
// - The outstanding table is sharded by key hash; every state transition for
//   a key (register, resolve, expire, cancel, abort) happens under that key's
//   shard lock, so the first transition to remove an entry wins and the rest
//   observe "not found".
// - Each entry owns the only `oneshot::Sender` of its result, so a handle is
//   completed at most once by construction.
// - Deadline timers hold a `Weak` reference and the request id, so a stale
//   timer can never expire a newer request registered under the same key.
// ============================================================================

use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use ahash::{AHashMap, AHashSet, AHasher};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::CollectionError;
use crate::log_collection;
use crate::metrics::{CorrelatorMetrics, RequestOutcome};
use crate::sample::{AgentReply, EndpointReply, FromSample, Sample};
use crate::types::{
    CollectorId, CorrelationKey, EndpointSide, MeasurementEndpoint, MeasurementTarget, NodeId, RequestKind,
    Timestamp,
};
use crate::CORRELATOR_SHARDS;

type ResultSender = oneshot::Sender<Result<Sample, CollectionError>>;
type ResultReceiver = oneshot::Receiver<Result<Sample, CollectionError>>;

// ----------------------------------------------------------------------------
// Pending Result Handle
// ----------------------------------------------------------------------------

/// Write-once handle to the outcome of a measurement request.
///
/// Awaiting it yields the sample, or the reason the request failed. Dropping
/// it does not withdraw the request; use [`RequestCorrelator::cancel`].
pub struct PendingResult<T = Sample> {
    key: CorrelationKey,
    request_id: Uuid,
    requested_at: Timestamp,
    deadline: Instant,
    receiver: ResultReceiver,
    convert: fn(Sample) -> Option<T>,
}

impl<T> fmt::Debug for PendingResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResult")
            .field("key", &self.key)
            .field("request_id", &self.request_id)
            .field("requested_at", &self.requested_at)
            .finish()
    }
}

impl<T> PendingResult<T> {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn requested_at(&self) -> Timestamp {
        self.requested_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl PendingResult<Sample> {
    /// Narrow the handle to the concrete sample type of its request kind.
    pub fn typed<T: FromSample>(self) -> PendingResult<T> {
        PendingResult {
            key: self.key,
            request_id: self.request_id,
            requested_at: self.requested_at,
            deadline: self.deadline,
            receiver: self.receiver,
            convert: T::from_sample,
        }
    }
}

impl<T> Future for PendingResult<T> {
    type Output = Result<T, CollectionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(outcome) => outcome,
        };
        Poll::Ready(match outcome {
            Ok(Ok(sample)) => {
                let kind = sample.kind();
                (self.convert)(sample).ok_or_else(|| {
                    CollectionError::aborted(format!("reply carried a {} sample", kind))
                })
            }
            Ok(Err(e)) => Err(e),
            // The entry was withdrawn without an outcome.
            Err(_) => Err(CollectionError::Cancelled),
        })
    }
}

// ----------------------------------------------------------------------------
// Outstanding Request Table
// ----------------------------------------------------------------------------

struct Outstanding {
    id: Uuid,
    started: Instant,
    duration: Duration,
    sender: ResultSender,
    timer: Option<AbortHandle>,
    halves: [Option<EndpointReply>; 2],
}

impl Outstanding {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

fn side_index(side: EndpointSide) -> usize {
    match side {
        EndpointSide::Source => 0,
        EndpointSide::Destination => 1,
    }
}

const SIDES: [EndpointSide; 2] = [EndpointSide::Source, EndpointSide::Destination];

/// Result of delivering one endpoint half to the correlator. When several
/// requests share the endpoint, the strongest outcome among them is reported
/// (in declaration order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Delivery {
    /// Both halves are in; the request was resolved.
    Resolved,
    /// Half stored, waiting for the other endpoint.
    Stored,
    /// This endpoint had already replied.
    DuplicateHalf,
    /// No outstanding request for this endpoint.
    Unknown,
}

struct Inner {
    shards: Box<[Mutex<AHashMap<CorrelationKey, Outstanding>>]>,
    /// Requests on different links may observe the same endpoint (a shared
    /// source port sampling the same flow), so one endpoint maps to a set.
    endpoints: DashMap<MeasurementEndpoint, AHashSet<CorrelationKey>>,
    margin: Duration,
    outstanding: AtomicUsize,
    metrics: CorrelatorMetrics,
}

impl Inner {
    #[inline]
    fn shard(&self, key: &CorrelationKey) -> &Mutex<AHashMap<CorrelationKey, Outstanding>> {
        let mut hasher = AHasher::default();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Remove `key` if present (and, when `id` is given, only if it is that
    /// request). Must be called with the key's shard locked.
    fn take_locked(
        &self,
        shard: &mut AHashMap<CorrelationKey, Outstanding>,
        key: &CorrelationKey,
        id: Option<Uuid>,
    ) -> Option<Outstanding> {
        if let Some(id) = id {
            if shard.get(key).map(|e| e.id) != Some(id) {
                return None;
            }
        }
        let mut entry = shard.remove(key)?;
        for side in SIDES {
            let endpoint = key.target.endpoint(side);
            if let Some(mut owners) = self.endpoints.get_mut(&endpoint) {
                owners.remove(key);
            }
            self.endpoints.remove_if(&endpoint, |_, owners| owners.is_empty());
        }
        entry.disarm();
        let remaining = self.outstanding.fetch_sub(1, AtomicOrdering::AcqRel) - 1;
        self.metrics.outstanding_requests.set(remaining as i64);
        Some(entry)
    }

    fn take(&self, key: &CorrelationKey, id: Option<Uuid>) -> Option<Outstanding> {
        let mut shard = self.shard(key).lock();
        self.take_locked(&mut shard, key, id)
    }

    fn expire(&self, key: &CorrelationKey, id: Option<Uuid>) -> bool {
        let Some(entry) = self.take(key, id) else {
            return false;
        };
        let waited = entry.started.elapsed();
        log_collection!("expired", key, waited_ms = waited.as_millis() as u64);
        self.metrics.record(key.kind, RequestOutcome::Expired);
        let _ = entry.sender.send(Err(CollectionError::TimedOut { waited }));
        true
    }

    fn late_reply(&self, kind: RequestKind, what: &dyn fmt::Display) {
        trace!(target: "flowwatch::correlator", reply = %what, "Dropping reply for no outstanding request");
        self.metrics.record_late_reply(kind);
    }
}

fn arm_timer(inner: &Arc<Inner>, key: CorrelationKey, id: Uuid, deadline: Instant) -> AbortHandle {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        if let Some(inner) = weak.upgrade() {
            inner.expire(&key, Some(id));
        }
    })
    .abort_handle()
}

// ----------------------------------------------------------------------------
// Request Correlator
// ----------------------------------------------------------------------------

/// Maps outstanding requests to pending results; arms, disarms and fires
/// their deadlines; completes every result exactly once.
#[derive(Clone)]
pub struct RequestCorrelator {
    inner: Arc<Inner>,
}

impl fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("outstanding", &self.outstanding_count())
            .field("margin", &self.inner.margin)
            .finish()
    }
}

impl RequestCorrelator {
    /// `margin` is added to every requested duration to form its deadline.
    pub fn new(margin: Duration, metrics: CorrelatorMetrics) -> Self {
        let shards = (0..CORRELATOR_SHARDS)
            .map(|_| Mutex::new(AHashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            inner: Arc::new(Inner {
                shards,
                endpoints: DashMap::new(),
                margin,
                outstanding: AtomicUsize::new(0),
                metrics,
            }),
        }
    }

    pub fn deadline_margin(&self) -> Duration {
        self.inner.margin
    }

    pub fn metrics(&self) -> &CorrelatorMetrics {
        &self.inner.metrics
    }

    pub fn outstanding_count(&self) -> usize {
        self.inner.outstanding.load(AtomicOrdering::Acquire)
    }

    pub fn is_outstanding(&self, target: &MeasurementTarget, kind: RequestKind) -> bool {
        let key = CorrelationKey::new(target.clone(), kind);
        self.inner.shard(&key).lock().contains_key(&key)
    }

    /// Snapshot of every outstanding key, sorted.
    pub fn outstanding_keys(&self) -> Vec<CorrelationKey> {
        let mut keys: Vec<CorrelationKey> = self
            .inner
            .shards
            .iter()
            .flat_map(|shard| shard.lock().keys().cloned().collect::<Vec<_>>())
            .collect();
        keys.sort();
        keys
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Create the pending request for `(target, kind)` with a deadline of
    /// `now + duration + margin`. Fails if one is already outstanding.
    ///
    /// Must be called from within a tokio runtime (the deadline timer is a
    /// spawned task).
    pub fn register(
        &self,
        target: MeasurementTarget,
        kind: RequestKind,
        duration: Duration,
    ) -> Result<PendingResult, CollectionError> {
        let inner = &self.inner;
        let key = CorrelationKey::new(target, kind);
        let id = Uuid::new_v4();
        let started = Instant::now();
        let deadline = started + duration + inner.margin;
        let (sender, receiver) = oneshot::channel();

        {
            let mut shard = inner.shard(&key).lock();
            if shard.contains_key(&key) {
                inner.metrics.record(kind, RequestOutcome::Duplicate);
                return Err(duplicate(&key));
            }
            self.index_endpoints(&key);
            shard.insert(
                key.clone(),
                Outstanding {
                    id,
                    started,
                    duration,
                    sender,
                    timer: None,
                    halves: [None, None],
                },
            );
            let outstanding = inner.outstanding.fetch_add(1, AtomicOrdering::AcqRel) + 1;
            inner.metrics.outstanding_requests.set(outstanding as i64);
        }

        // Armed outside the lock; a timer that fires early still checks the id.
        let timer = arm_timer(inner, key.clone(), id, deadline);
        {
            let mut shard = inner.shard(&key).lock();
            match shard.get_mut(&key) {
                Some(entry) if entry.id == id => entry.timer = Some(timer),
                _ => timer.abort(),
            }
        }

        inner.metrics.record(kind, RequestOutcome::Registered);
        log_collection!(
            "registered",
            key,
            request_id = %id,
            deadline_ms = (duration + inner.margin).as_millis() as u64
        );

        Ok(PendingResult {
            key,
            request_id: id,
            requested_at: Timestamp::now(),
            deadline,
            receiver,
            convert: Some,
        })
    }

    /// Index both endpoints of `key`. Called with the key's shard locked.
    fn index_endpoints(&self, key: &CorrelationKey) {
        for side in SIDES {
            self.inner
                .endpoints
                .entry(key.target.endpoint(side))
                .or_default()
                .insert(key.clone());
        }
    }

    // ------------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------------

    /// Fulfill the pending request for `(target, kind)` with `sample`.
    /// A reply for no outstanding request is dropped. Returns true if a
    /// request was resolved.
    pub fn resolve(&self, target: &MeasurementTarget, kind: RequestKind, sample: Sample) -> bool {
        if sample.kind() != kind {
            warn!(
                target: "flowwatch::correlator",
                expected = %kind,
                got = %sample.kind(),
                "Ignoring reply with a sample of the wrong kind"
            );
            return false;
        }
        let key = CorrelationKey::new(target.clone(), kind);
        match self.inner.take(&key, None) {
            Some(entry) => {
                self.complete(&key, entry, sample);
                true
            }
            None => {
                self.inner.late_reply(kind, &key);
                false
            }
        }
    }

    fn complete(&self, key: &CorrelationKey, entry: Outstanding, sample: Sample) {
        let elapsed = entry.started.elapsed();
        self.inner.metrics.record(key.kind, RequestOutcome::Resolved);
        self.inner.metrics.observe_latency(key.kind, elapsed);
        log_collection!("resolved", key, elapsed_ms = elapsed.as_millis() as u64);
        let _ = entry.sender.send(Ok(sample));
    }

    /// Fail the pending request with `TimedOut` if it is still outstanding.
    pub fn expire(&self, target: &MeasurementTarget, kind: RequestKind) -> bool {
        self.inner
            .expire(&CorrelationKey::new(target.clone(), kind), None)
    }

    /// Withdraw the request. Its handle completes with `Cancelled`.
    pub fn cancel(&self, target: &MeasurementTarget, kind: RequestKind) -> bool {
        let key = CorrelationKey::new(target.clone(), kind);
        match self.inner.take(&key, None) {
            Some(entry) => {
                self.inner.metrics.record(kind, RequestOutcome::Cancelled);
                log_collection!("cancelled", key);
                drop(entry.sender);
                true
            }
            None => false,
        }
    }

    /// Remove the request and fail its handle with `error`.
    pub fn fail(&self, target: &MeasurementTarget, kind: RequestKind, error: CollectionError) -> bool {
        let key = CorrelationKey::new(target.clone(), kind);
        self.fail_entry(&key, None, error)
    }

    /// Like [`fail`](Self::fail), but only if `key` is still held by the
    /// request `id`. A request registered later under the same key is left
    /// alone.
    pub fn fail_request(&self, key: &CorrelationKey, id: Uuid, error: CollectionError) -> bool {
        self.fail_entry(key, Some(id), error)
    }

    fn fail_entry(&self, key: &CorrelationKey, id: Option<Uuid>, error: CollectionError) -> bool {
        let Some(entry) = self.inner.take(key, id) else {
            return false;
        };
        let kind = key.kind;
        let outcome = match error {
            CollectionError::Dispatch(_) => RequestOutcome::DispatchFailed,
            CollectionError::TimedOut { .. } => RequestOutcome::Expired,
            CollectionError::Cancelled => RequestOutcome::Cancelled,
            _ => RequestOutcome::Aborted,
        };
        self.inner.metrics.record(kind, outcome);
        log_collection!("failed", key, reason = %error);
        let _ = entry.sender.send(Err(error));
        true
    }

    /// Abort every outstanding request whose link touches one of `nodes`.
    /// Returns how many were aborted.
    pub fn abort_touching(&self, nodes: &[NodeId], reason: &str) -> usize {
        let mut aborted = Vec::new();
        for shard in self.inner.shards.iter() {
            let mut shard = shard.lock();
            let keys: Vec<CorrelationKey> = shard
                .keys()
                .filter(|key| nodes.iter().any(|n| key.target.has_node(*n)))
                .cloned()
                .collect();
            for key in keys {
                if let Some(entry) = self.inner.take_locked(&mut shard, &key, None) {
                    aborted.push((key, entry));
                }
            }
        }

        let count = aborted.len();
        for (key, entry) in aborted {
            self.inner.metrics.record(key.kind, RequestOutcome::Aborted);
            log_collection!("aborted", key, reason = reason);
            let _ = entry.sender.send(Err(CollectionError::aborted(reason)));
        }
        count
    }

    /// Withdraw every outstanding request; their handles complete with
    /// `Cancelled`.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for shard in self.inner.shards.iter() {
            let mut shard = shard.lock();
            let keys: Vec<CorrelationKey> = shard.keys().cloned().collect();
            for key in keys {
                if self.inner.take_locked(&mut shard, &key, None).is_some() {
                    self.inner.metrics.record(key.kind, RequestOutcome::Cancelled);
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    // ------------------------------------------------------------------------
    // Two-endpoint assembly
    // ------------------------------------------------------------------------

    /// Accept the half-reply of one collector. A request resolves once both
    /// of its endpoints have replied. A half is offered to every outstanding
    /// request observing that endpoint.
    pub fn deliver_endpoint_reply(&self, reply: AgentReply) -> Delivery {
        let kind = reply.endpoint.kind();
        let mut owners: Vec<CorrelationKey> = self
            .inner
            .endpoints
            .get(&reply.endpoint)
            .map(|owners| owners.iter().cloned().collect())
            .unwrap_or_default();
        owners.sort();

        let collector = reply.collector.clone();
        let (endpoint, half) = reply.into_half();
        let delivery = owners
            .iter()
            .map(|key| self.deliver_half(key, &endpoint, half.clone(), &collector))
            .min()
            .unwrap_or(Delivery::Unknown);
        if delivery == Delivery::Unknown {
            self.inner.late_reply(kind, &endpoint);
        }
        delivery
    }

    fn deliver_half(
        &self,
        key: &CorrelationKey,
        endpoint: &MeasurementEndpoint,
        half: EndpointReply,
        collector: &CollectorId,
    ) -> Delivery {
        if key.target.endpoint(endpoint.side()) != *endpoint {
            return Delivery::Unknown;
        }
        let slot = side_index(endpoint.side());

        let resolved = {
            let mut shard = self.inner.shard(key).lock();
            let Some(entry) = shard.get_mut(key) else {
                return Delivery::Unknown;
            };
            if entry.halves[slot].is_some() {
                debug!(
                    target: "flowwatch::correlator",
                    key = %key,
                    collector = %collector,
                    side = %endpoint.side(),
                    "Ignoring duplicate half-reply"
                );
                return Delivery::DuplicateHalf;
            }
            entry.halves[slot] = Some(half);
            if entry.halves.iter().all(Option::is_some) {
                self.inner.take_locked(&mut shard, key, None)
            } else {
                None
            }
        };

        let Some(mut entry) = resolved else {
            trace!(
                target: "flowwatch::correlator",
                key = %key,
                side = %endpoint.side(),
                "Stored half-reply"
            );
            return Delivery::Stored;
        };

        let [Some(source), Some(destination)] = std::mem::take(&mut entry.halves) else {
            return Delivery::Stored;
        };
        match Sample::assemble(&key.target, entry.duration, &source, &destination) {
            Some(sample) => {
                self.complete(key, entry, sample);
            }
            None => {
                let error = CollectionError::aborted("collectors replied with mismatched payloads");
                self.inner.metrics.record(key.kind, RequestOutcome::Aborted);
                warn!(target: "flowwatch::correlator", key = %key, "Collectors replied with mismatched payloads");
                let _ = entry.sender.send(Err(error));
            }
        }
        Delivery::Resolved
    }
}

fn duplicate(key: &CorrelationKey) -> CollectionError {
    CollectionError::Duplicate {
        target: key.target.to_string(),
        kind: key.kind.to_string(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{ReplyPayload, SecureProbingSample, TimedPacketSummary, TrajectorySample};
    use crate::types::{BitMatch, CollectorId, DatapathLink, FlowedLink};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn correlator(margin: Duration) -> RequestCorrelator {
        RequestCorrelator::new(margin, CorrelatorMetrics::unregistered().unwrap())
    }

    fn probe_target(port: u32) -> MeasurementTarget {
        MeasurementTarget::Probe {
            link: format!("1[{}]>2[{}]", port, port).parse().unwrap(),
            bit_match: BitMatch::new(0xbeef, 0xffff),
        }
    }

    fn probe_sample(target: &MeasurementTarget) -> Sample {
        Sample::SecureProbing(SecureProbingSample::no_results(*target.link()))
    }

    #[tokio::test]
    async fn test_register_then_resolve() {
        let correlator = correlator(Duration::from_secs(2));
        let target = probe_target(1);

        let pending = correlator
            .register(target.clone(), RequestKind::Probing, Duration::from_secs(1))
            .unwrap();
        assert!(correlator.is_outstanding(&target, RequestKind::Probing));

        assert!(correlator.resolve(&target, RequestKind::Probing, probe_sample(&target)));
        assert_eq!(pending.await.unwrap(), probe_sample(&target));
        assert_eq!(correlator.outstanding_count(), 0);
        assert!(!correlator.resolve(&target, RequestKind::Probing, probe_sample(&target)));
    }

    #[tokio::test]
    async fn test_handle_stays_pending_until_resolved() {
        let correlator = correlator(Duration::from_secs(2));
        let target = probe_target(2);
        let pending = correlator
            .register(target.clone(), RequestKind::Probing, Duration::from_secs(1))
            .unwrap();

        let mut task = tokio_test::task::spawn(pending);
        tokio_test::assert_pending!(task.poll());

        correlator.resolve(&target, RequestKind::Probing, probe_sample(&target));
        assert!(task.is_woken());
        let sample = tokio_test::assert_ready_ok!(task.poll());
        assert_eq!(sample, probe_sample(&target));
    }

    #[tokio::test]
    async fn test_duplicate_register_fails_fast() {
        let correlator = correlator(Duration::from_secs(2));
        let target = probe_target(1);

        let _first = correlator
            .register(target.clone(), RequestKind::Probing, Duration::from_secs(1))
            .unwrap();
        let err = correlator
            .register(target.clone(), RequestKind::Probing, Duration::from_secs(1))
            .unwrap_err();

        assert!(matches!(err, CollectionError::Duplicate { .. }));
        assert_eq!(correlator.metrics().count(RequestKind::Probing, RequestOutcome::Duplicate), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_includes_margin_and_late_reply_is_ignored() {
        let correlator = correlator(Duration::from_secs(2));
        let target = probe_target(3);

        let pending = correlator
            .register(target.clone(), RequestKind::Probing, Duration::from_secs(2))
            .unwrap();

        tokio::time::advance(Duration::from_millis(3_900)).await;
        assert!(correlator.is_outstanding(&target, RequestKind::Probing));

        match pending.await {
            Err(CollectionError::TimedOut { waited }) => assert!(waited >= Duration::from_secs(4)),
            other => panic!("expected a timeout, got {:?}", other),
        }

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!correlator.resolve(&target, RequestKind::Probing, probe_sample(&target)));
        assert_eq!(correlator.metrics().late_replies_total.with_label_values(&["probing"]).get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistered_key_outlives_previous_deadline() {
        let correlator = correlator(Duration::from_millis(100));
        let target = probe_target(4);

        let first = correlator
            .register(target.clone(), RequestKind::Probing, Duration::from_secs(1))
            .unwrap();
        assert!(correlator.cancel(&target, RequestKind::Probing));
        assert_eq!(first.await, Err(CollectionError::Cancelled));

        tokio::time::advance(Duration::from_millis(500)).await;
        let second = correlator
            .register(target.clone(), RequestKind::Probing, Duration::from_secs(1))
            .unwrap();

        // The first request's deadline (1.1s) passes without effect.
        tokio::time::advance(Duration::from_millis(700)).await;
        tokio::task::yield_now().await;
        assert!(correlator.is_outstanding(&target, RequestKind::Probing));

        assert!(correlator.resolve(&target, RequestKind::Probing, probe_sample(&target)));
        assert!(second.await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_and_fail() {
        let correlator = correlator(Duration::from_secs(2));
        let target = probe_target(5);

        let pending = correlator
            .register(target.clone(), RequestKind::Probing, Duration::from_secs(1))
            .unwrap();
        let err = CollectionError::Dispatch(crate::error::DispatchError::Closed);
        assert!(correlator.fail(&target, RequestKind::Probing, err.clone()));
        assert!(!correlator.cancel(&target, RequestKind::Probing));
        assert_eq!(pending.await, Err(err));
    }

    #[tokio::test]
    async fn test_abort_touching_node() {
        let correlator = correlator(Duration::from_secs(2));
        let on_node_2 = probe_target(1);
        let elsewhere = MeasurementTarget::Probe {
            link: "3[1]>4[1]".parse().unwrap(),
            bit_match: BitMatch::new(1, 1),
        };

        let aborted = correlator
            .register(on_node_2.clone(), RequestKind::Probing, Duration::from_secs(1))
            .unwrap();
        let _kept = correlator
            .register(elsewhere.clone(), RequestKind::Probing, Duration::from_secs(1))
            .unwrap();

        assert_eq!(correlator.abort_touching(&[NodeId(2)], "disconnected collector"), 1);
        assert_eq!(
            aborted.await,
            Err(CollectionError::aborted("disconnected collector"))
        );
        assert_eq!(correlator.outstanding_keys().len(), 1);
    }

    #[tokio::test]
    async fn test_two_endpoint_assembly() {
        let correlator = correlator(Duration::from_secs(2));
        let link: DatapathLink = "1[1]>2[1]".parse().unwrap();
        let bit_match = BitMatch::new(0x1, 0xff);
        let target = MeasurementTarget::Probe { link, bit_match };

        let pending = correlator
            .register(target.clone(), RequestKind::Probing, Duration::from_secs(1))
            .unwrap()
            .typed::<SecureProbingSample>();

        let half = |side, millis| AgentReply {
            collector: CollectorId::new("agent"),
            endpoint: target.endpoint(side),
            finished_at: Timestamp::from_millis(millis),
            payload: ReplyPayload::Probe(Some(TimedPacketSummary::new(9, 60, Timestamp::from_millis(millis)))),
        };

        assert_eq!(correlator.deliver_endpoint_reply(half(EndpointSide::Destination, 20)), Delivery::Stored);
        assert_eq!(
            correlator.deliver_endpoint_reply(half(EndpointSide::Destination, 21)),
            Delivery::DuplicateHalf
        );
        assert_eq!(correlator.deliver_endpoint_reply(half(EndpointSide::Source, 10)), Delivery::Resolved);
        assert_eq!(correlator.deliver_endpoint_reply(half(EndpointSide::Source, 10)), Delivery::Unknown);

        let sample = pending.await.unwrap();
        assert_eq!(sample.latency(), Some(Duration::from_millis(10)));
        assert_eq!(sample.results.unwrap().finished_at, Timestamp::from_millis(20));
    }

    #[tokio::test]
    async fn test_links_sharing_a_source_port() {
        let correlator = correlator(Duration::from_secs(2));
        let first = MeasurementTarget::Flowed("1[1]>2[1]@eth_type=0x0800".parse().unwrap());
        let second = MeasurementTarget::Flowed("1[1]>3[5]@eth_type=0x0800".parse().unwrap());
        assert_eq!(
            first.endpoint(EndpointSide::Source),
            second.endpoint(EndpointSide::Source)
        );

        let first_pending = correlator
            .register(first.clone(), RequestKind::Sampling, Duration::from_secs(1))
            .unwrap();
        let second_pending = correlator
            .register(second.clone(), RequestKind::Sampling, Duration::from_secs(1))
            .unwrap();

        let half = |target: &MeasurementTarget, side| AgentReply {
            collector: CollectorId::new("agent"),
            endpoint: target.endpoint(side),
            finished_at: Timestamp::from_millis(5),
            payload: ReplyPayload::Trajectory(Default::default()),
        };

        // One source half serves both requests.
        assert_eq!(correlator.deliver_endpoint_reply(half(&first, EndpointSide::Source)), Delivery::Stored);
        assert_eq!(
            correlator.deliver_endpoint_reply(half(&second, EndpointSide::Source)),
            Delivery::DuplicateHalf
        );
        assert_eq!(correlator.deliver_endpoint_reply(half(&first, EndpointSide::Destination)), Delivery::Resolved);
        assert!(first_pending.await.is_ok());
        assert!(correlator.is_outstanding(&second, RequestKind::Sampling));

        assert_eq!(correlator.deliver_endpoint_reply(half(&second, EndpointSide::Destination)), Delivery::Resolved);
        assert!(second_pending.await.is_ok());
        assert_eq!(correlator.outstanding_count(), 0);
        assert_eq!(correlator.deliver_endpoint_reply(half(&first, EndpointSide::Source)), Delivery::Unknown);
    }

    #[tokio::test]
    async fn test_fail_request_spares_newer_registration() {
        let correlator = correlator(Duration::from_secs(2));
        let target = probe_target(6);

        let stale = correlator
            .register(target.clone(), RequestKind::Probing, Duration::from_secs(1))
            .unwrap();
        let stale_id = stale.request_id();
        let key = stale.key().clone();
        assert!(correlator.cancel(&target, RequestKind::Probing));
        let current = correlator
            .register(target.clone(), RequestKind::Probing, Duration::from_secs(1))
            .unwrap();

        let err = CollectionError::Dispatch(crate::error::DispatchError::Closed);
        assert!(!correlator.fail_request(&key, stale_id, err.clone()));
        assert!(correlator.is_outstanding(&target, RequestKind::Probing));

        assert!(correlator.fail_request(&key, current.request_id(), err.clone()));
        assert_eq!(current.await, Err(err));
    }

    #[tokio::test]
    async fn test_typed_handle_rejects_wrong_sample() {
        let correlator = correlator(Duration::from_secs(2));
        let flowed: FlowedLink = "1[1]>2[1]@ip_proto=6".parse().unwrap();
        let target = MeasurementTarget::Flowed(flowed.clone());

        let pending = correlator
            .register(target.clone(), RequestKind::Sampling, Duration::from_secs(1))
            .unwrap()
            .typed::<TrajectorySample>();

        // Wrong kind for the key: left outstanding.
        assert!(!correlator.resolve(&target, RequestKind::Sampling, probe_sample(&target)));
        assert!(correlator.resolve(
            &target,
            RequestKind::Sampling,
            Sample::Trajectory(TrajectorySample::no_results(flowed))
        ));
        assert!(!pending.await.unwrap().has_results());
    }

    #[test]
    fn test_resolve_and_expire_race_settles_once() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            for round in 0..200u32 {
                let correlator = correlator(Duration::from_secs(60));
                let target = probe_target(round);
                let pending = correlator
                    .register(target.clone(), RequestKind::Probing, Duration::from_secs(60))
                    .unwrap();

                let resolver = {
                    let correlator = correlator.clone();
                    let target = target.clone();
                    tokio::spawn(async move {
                        correlator.resolve(&target, RequestKind::Probing, probe_sample(&target))
                    })
                };
                let expirer = {
                    let correlator = correlator.clone();
                    let target = target.clone();
                    tokio::spawn(async move { correlator.expire(&target, RequestKind::Probing) })
                };

                let resolved = resolver.await.unwrap();
                let expired = expirer.await.unwrap();
                assert!(resolved ^ expired, "exactly one transition must win");

                match pending.await {
                    Ok(_) => assert!(resolved),
                    Err(CollectionError::TimedOut { .. }) => assert!(expired),
                    Err(other) => panic!("unexpected outcome {:?}", other),
                }
                assert_eq!(correlator.outstanding_count(), 0);
            }
        });
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_concurrent_registers_admit_exactly_one(callers in 2usize..24, port in 1u32..4096) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();

            let (admitted, rejected) = runtime.block_on(async move {
                let correlator = correlator(Duration::from_secs(60));
                let target = probe_target(port);
                let tasks: Vec<_> = (0..callers)
                    .map(|_| {
                        let correlator = correlator.clone();
                        let target = target.clone();
                        tokio::spawn(async move {
                            correlator.register(target, RequestKind::Probing, Duration::from_secs(60))
                        })
                    })
                    .collect();

                let mut admitted = Vec::new();
                let mut rejected = 0;
                for task in tasks {
                    match task.await.unwrap() {
                        Ok(pending) => admitted.push(pending),
                        Err(CollectionError::Duplicate { .. }) => rejected += 1,
                        Err(other) => panic!("unexpected error {:?}", other),
                    }
                }
                assert_eq!(correlator.outstanding_count(), 1);
                (admitted.len(), rejected)
            });

            prop_assert_eq!(admitted, 1);
            prop_assert_eq!(rejected, callers - 1);
        }
    }
}
