// ============================================================================
// PROMETHEUS METRICS
// ============================================================================
// Counters and gauges describing the outstanding-request table. Registered in
// a caller-provided registry so several engines can coexist in one process.
// ============================================================================

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::types::RequestKind;

/// What happened to a measurement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOutcome {
    Registered,
    Resolved,
    Expired,
    Cancelled,
    Aborted,
    Duplicate,
    DispatchFailed,
    MissingCollector,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestOutcome::Registered => "registered",
            RequestOutcome::Resolved => "resolved",
            RequestOutcome::Expired => "expired",
            RequestOutcome::Cancelled => "cancelled",
            RequestOutcome::Aborted => "aborted",
            RequestOutcome::Duplicate => "duplicate",
            RequestOutcome::DispatchFailed => "dispatch_failed",
            RequestOutcome::MissingCollector => "missing_collector",
        }
    }
}

/// Metrics exported by the request correlator and collector handler.
#[derive(Debug, Clone)]
pub struct CorrelatorMetrics {
    pub requests_total: IntCounterVec,
    pub outstanding_requests: IntGauge,
    pub late_replies_total: IntCounterVec,
    pub collection_latency: HistogramVec,
}

impl CorrelatorMetrics {
    /// Create the metrics and register them in `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::unregistered()?;
        registry.register(Box::new(metrics.requests_total.clone()))?;
        registry.register(Box::new(metrics.outstanding_requests.clone()))?;
        registry.register(Box::new(metrics.late_replies_total.clone()))?;
        registry.register(Box::new(metrics.collection_latency.clone()))?;
        Ok(metrics)
    }

    /// Metrics that are recorded but exported nowhere.
    pub fn unregistered() -> Result<Self, prometheus::Error> {
        Ok(Self {
            requests_total: IntCounterVec::new(
                Opts::new(
                    "flowwatch_collection_requests_total",
                    "Measurement requests by kind and outcome",
                ),
                &["kind", "outcome"],
            )?,
            outstanding_requests: IntGauge::new(
                "flowwatch_outstanding_requests",
                "Measurement requests currently awaiting a reply",
            )?,
            late_replies_total: IntCounterVec::new(
                Opts::new(
                    "flowwatch_late_replies_total",
                    "Replies that arrived for no outstanding request",
                ),
                &["kind"],
            )?,
            collection_latency: HistogramVec::new(
                HistogramOpts::new(
                    "flowwatch_collection_latency_seconds",
                    "Time from request registration to its resolution",
                )
                .buckets(vec![0.5, 1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0]),
                &["kind"],
            )?,
        })
    }

    #[inline]
    pub fn record(&self, kind: RequestKind, outcome: RequestOutcome) {
        self.requests_total
            .with_label_values(&[kind.as_str(), outcome.as_str()])
            .inc();
    }

    #[inline]
    pub fn record_late_reply(&self, kind: RequestKind) {
        self.late_replies_total.with_label_values(&[kind.as_str()]).inc();
    }

    #[inline]
    pub fn observe_latency(&self, kind: RequestKind, elapsed: Duration) {
        self.collection_latency
            .with_label_values(&[kind.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn count(&self, kind: RequestKind, outcome: RequestOutcome) -> u64 {
        self.requests_total
            .with_label_values(&[kind.as_str(), outcome.as_str()])
            .get()
    }
}

/// Render every metric in `registry` in the text exposition format.
pub fn render_text(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::warn!(target: "flowwatch::metrics", error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
