// ============================================================================
// MEASUREMENT SAMPLES
// ============================================================================
// Immutable results of a fulfilled measurement request, plus the half-replies
// collector agents send for their own link endpoint.
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{
    BitMatch, CollectorId, DatapathLink, EndpointSide, FlowedLink, MeasurementEndpoint, MeasurementTarget,
    RequestKind, Timestamp,
};

// ----------------------------------------------------------------------------
// Packet Summaries
// ----------------------------------------------------------------------------

/// Digest of one observed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketSummary {
    pub hash: u64,
    pub length: u32,
}

/// A packet digest together with the instant the collector saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimedPacketSummary {
    pub summary: PacketSummary,
    pub timestamp: Timestamp,
}

impl TimedPacketSummary {
    pub fn new(hash: u64, length: u32, timestamp: Timestamp) -> Self {
        Self {
            summary: PacketSummary { hash, length },
            timestamp,
        }
    }
}

/// What one endpoint observed during passive sampling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointTrajectory {
    pub summaries: Vec<TimedPacketSummary>,
    pub unmatched_bytes: u64,
    pub unmatched_packets: u64,
}

// ----------------------------------------------------------------------------
// Trajectory Samples (passive)
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryResults {
    pub collect_duration: Duration,
    pub finished_at: Timestamp,
    pub source: EndpointTrajectory,
    pub destination: EndpointTrajectory,
}

/// Result of sampling one flow over one link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectorySample {
    pub link: FlowedLink,
    pub results: Option<TrajectoryResults>,
}

impl TrajectorySample {
    pub fn new(link: FlowedLink, results: TrajectoryResults) -> Self {
        Self {
            link,
            results: Some(results),
        }
    }

    /// Placeholder published when a sampling round produced nothing.
    pub fn no_results(link: FlowedLink) -> Self {
        Self { link, results: None }
    }

    pub fn has_results(&self) -> bool {
        self.results.is_some()
    }

    /// Packets seen at the source and never at the destination.
    pub fn lost_packets(&self) -> Option<usize> {
        let results = self.results.as_ref()?;
        let lost = results
            .source
            .summaries
            .iter()
            .filter(|src| {
                !results
                    .destination
                    .summaries
                    .iter()
                    .any(|dest| dest.summary == src.summary)
            })
            .count();
        Some(lost)
    }
}

// ----------------------------------------------------------------------------
// Secure Probing Samples (active)
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbingResults {
    pub bit_match: BitMatch,
    pub collect_duration: Duration,
    pub finished_at: Timestamp,
    pub source: Option<TimedPacketSummary>,
    pub destination: Option<TimedPacketSummary>,
}

/// Result of probing one link with packets tagged by a bit pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureProbingSample {
    pub link: DatapathLink,
    pub results: Option<ProbingResults>,
}

impl SecureProbingSample {
    pub fn new(link: DatapathLink, results: ProbingResults) -> Self {
        Self {
            link,
            results: Some(results),
        }
    }

    pub fn no_results(link: DatapathLink) -> Self {
        Self { link, results: None }
    }

    pub fn has_results(&self) -> bool {
        self.results.is_some()
    }

    /// One-way latency of the probe, when both endpoints saw it.
    pub fn latency(&self) -> Option<Duration> {
        let results = self.results.as_ref()?;
        let src = results.source?;
        let dest = results.destination?;
        Some(dest.timestamp.duration_since(src.timestamp))
    }
}

// ----------------------------------------------------------------------------
// Tagged Sample
// ----------------------------------------------------------------------------

/// A fulfilled measurement, tagged by the kind of request that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Sample {
    Trajectory(TrajectorySample),
    SecureProbing(SecureProbingSample),
}

impl Sample {
    pub fn kind(&self) -> RequestKind {
        match self {
            Sample::Trajectory(_) => RequestKind::Sampling,
            Sample::SecureProbing(_) => RequestKind::Probing,
        }
    }

    pub fn link(&self) -> &DatapathLink {
        match self {
            Sample::Trajectory(s) => &s.link.link,
            Sample::SecureProbing(s) => &s.link,
        }
    }

    pub fn has_results(&self) -> bool {
        match self {
            Sample::Trajectory(s) => s.has_results(),
            Sample::SecureProbing(s) => s.has_results(),
        }
    }

    /// Build a sample from the two endpoint halves of a measurement.
    /// Returns `None` if a half carries the wrong payload for the target.
    pub fn assemble(
        target: &MeasurementTarget,
        collect_duration: Duration,
        source: &EndpointReply,
        destination: &EndpointReply,
    ) -> Option<Sample> {
        let finished_at = source.finished_at.max(destination.finished_at);
        match (target, &source.payload, &destination.payload) {
            (
                MeasurementTarget::Flowed(flowed),
                ReplyPayload::Trajectory(src),
                ReplyPayload::Trajectory(dest),
            ) => Some(Sample::Trajectory(TrajectorySample::new(
                flowed.clone(),
                TrajectoryResults {
                    collect_duration,
                    finished_at,
                    source: src.clone(),
                    destination: dest.clone(),
                },
            ))),
            (MeasurementTarget::Probe { link, bit_match }, ReplyPayload::Probe(src), ReplyPayload::Probe(dest)) => {
                Some(Sample::SecureProbing(SecureProbingSample::new(
                    *link,
                    ProbingResults {
                        bit_match: *bit_match,
                        collect_duration,
                        finished_at,
                        source: *src,
                        destination: *dest,
                    },
                )))
            }
            _ => None,
        }
    }
}

impl Display for Sample {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = if self.has_results() { "results" } else { "no results" };
        match self {
            Sample::Trajectory(s) => write!(f, "trajectory sample for {} ({})", s.link, state),
            Sample::SecureProbing(s) => write!(f, "secure probing sample for {} ({})", s.link, state),
        }
    }
}

/// Typed view over [`Sample`], used by pending results to hand callers the
/// concrete sample type they asked for.
pub trait FromSample: Sized {
    const KIND: RequestKind;

    fn from_sample(sample: Sample) -> Option<Self>;
}

impl FromSample for TrajectorySample {
    const KIND: RequestKind = RequestKind::Sampling;

    fn from_sample(sample: Sample) -> Option<Self> {
        match sample {
            Sample::Trajectory(s) => Some(s),
            Sample::SecureProbing(_) => None,
        }
    }
}

impl FromSample for SecureProbingSample {
    const KIND: RequestKind = RequestKind::Probing;

    fn from_sample(sample: Sample) -> Option<Self> {
        match sample {
            Sample::SecureProbing(s) => Some(s),
            Sample::Trajectory(_) => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Agent Replies
// ----------------------------------------------------------------------------

/// The per-endpoint measurement payload a collector reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ReplyPayload {
    Trajectory(EndpointTrajectory),
    Probe(Option<TimedPacketSummary>),
}

/// One half of a measurement, held until its counterpart arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointReply {
    pub finished_at: Timestamp,
    pub payload: ReplyPayload,
}

/// A reply from a collector agent for a single endpoint of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReply {
    pub collector: CollectorId,
    pub endpoint: MeasurementEndpoint,
    pub finished_at: Timestamp,
    pub payload: ReplyPayload,
}

impl AgentReply {
    pub fn side(&self) -> EndpointSide {
        self.endpoint.side()
    }

    pub fn into_half(self) -> (MeasurementEndpoint, EndpointReply) {
        (
            self.endpoint,
            EndpointReply {
                finished_at: self.finished_at,
                payload: self.payload,
            },
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BitMatch;
    use pretty_assertions::assert_eq;

    fn probe_half(millis: i64, hash: u64) -> EndpointReply {
        EndpointReply {
            finished_at: Timestamp::from_millis(millis),
            payload: ReplyPayload::Probe(Some(TimedPacketSummary::new(hash, 64, Timestamp::from_millis(millis)))),
        }
    }

    #[test]
    fn test_assemble_probing_sample_uses_later_finish_time() {
        let link: DatapathLink = "1[1]>2[1]".parse().unwrap();
        let target = MeasurementTarget::Probe {
            link,
            bit_match: BitMatch::new(0xab, 0xff),
        };

        let sample = Sample::assemble(&target, Duration::from_secs(1), &probe_half(100, 7), &probe_half(130, 7))
            .unwrap();

        let Sample::SecureProbing(probing) = sample else {
            panic!("expected a probing sample");
        };
        let results = probing.results.clone().unwrap();
        assert_eq!(results.finished_at, Timestamp::from_millis(130));
        assert_eq!(probing.latency(), Some(Duration::from_millis(30)));
    }

    #[test]
    fn test_assemble_rejects_mismatched_payloads() {
        let flowed: FlowedLink = "1[1]>2[1]@ip_proto=17".parse().unwrap();
        let target = MeasurementTarget::Flowed(flowed);
        assert!(Sample::assemble(&target, Duration::from_secs(1), &probe_half(1, 1), &probe_half(2, 1)).is_none());
    }

    #[test]
    fn test_trajectory_lost_packets() {
        let flowed: FlowedLink = "1[1]>2[1]".parse().unwrap();
        let seen = |hash| TimedPacketSummary::new(hash, 100, Timestamp::EPOCH);
        let sample = TrajectorySample::new(
            flowed,
            TrajectoryResults {
                collect_duration: Duration::from_secs(1),
                finished_at: Timestamp::EPOCH,
                source: EndpointTrajectory {
                    summaries: vec![seen(1), seen(2), seen(3)],
                    ..Default::default()
                },
                destination: EndpointTrajectory {
                    summaries: vec![seen(1), seen(3)],
                    ..Default::default()
                },
            },
        );
        assert_eq!(sample.lost_packets(), Some(1));
        assert_eq!(TrajectorySample::no_results(sample.link.clone()).lost_packets(), None);
    }

    #[test]
    fn test_from_sample_checks_kind() {
        let link: DatapathLink = "1[1]>2[1]".parse().unwrap();
        let sample = Sample::SecureProbing(SecureProbingSample::no_results(link));
        assert_eq!(sample.kind(), SecureProbingSample::KIND);
        assert!(TrajectorySample::from_sample(sample.clone()).is_none());
        assert!(SecureProbingSample::from_sample(sample).is_some());
    }
}
