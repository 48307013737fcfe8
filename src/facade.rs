// ============================================================================
// MONITORING FACADE
// ============================================================================
// One start/stop/validate surface over the submodules that can monitor a
// flow. Each capability implements only the narrow `FlowMonitor` trait; the
// facade routes a flow to the first monitor that accepts it.
// ============================================================================

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::ValidationError;
use crate::lifecycle::Capability;
use crate::types::Flow;

/// A capability able to monitor flows.
///
/// `start_monitoring` and `stop_monitoring` return true only when they
/// changed state. Implementations must make that check-and-flip atomic so
/// that concurrent callers racing on the same flow see exactly one `true`.
pub trait FlowMonitor: Send + Sync + fmt::Debug {
    fn capability(&self) -> Capability;

    fn validate_flow(&self, flow: &Flow) -> Result<(), ValidationError>;

    fn start_monitoring(&self, flow: &Flow) -> Result<bool, ValidationError>;

    fn stop_monitoring(&self, flow: &Flow) -> Result<bool, ValidationError>;

    fn is_monitoring(&self, flow: &Flow) -> bool;

    fn monitored_flows(&self) -> Vec<Flow>;
}

#[derive(Debug, Clone, Default)]
pub struct MonitoringFacade {
    monitors: Vec<Arc<dyn FlowMonitor>>,
}

impl MonitoringFacade {
    /// Monitors are consulted in the given order.
    pub fn new(monitors: Vec<Arc<dyn FlowMonitor>>) -> Self {
        Self { monitors }
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.monitors.iter().map(|m| m.capability()).collect()
    }

    pub fn is_valid_monitorable_flow(&self, flow: &Flow) -> bool {
        self.owner(flow).is_ok()
    }

    pub fn validate_monitorable_flow(&self, flow: &Flow) -> Result<(), ValidationError> {
        self.owner(flow).map(|_| ())
    }

    pub fn start_monitoring(&self, flow: &Flow) -> Result<bool, ValidationError> {
        let monitor = self.owner(flow)?;
        let changed = monitor.start_monitoring(flow)?;
        debug!(
            target: "flowwatch::facade",
            flow = %flow,
            capability = %monitor.capability(),
            changed,
            "Start monitoring"
        );
        Ok(changed)
    }

    pub fn stop_monitoring(&self, flow: &Flow) -> Result<bool, ValidationError> {
        let monitor = self.owner(flow)?;
        let changed = monitor.stop_monitoring(flow)?;
        debug!(
            target: "flowwatch::facade",
            flow = %flow,
            capability = %monitor.capability(),
            changed,
            "Stop monitoring"
        );
        Ok(changed)
    }

    pub fn is_monitoring(&self, flow: &Flow) -> bool {
        self.monitors.iter().any(|m| m.is_monitoring(flow))
    }

    pub fn monitored_flows(&self) -> Vec<(Capability, Flow)> {
        self.monitors
            .iter()
            .flat_map(|m| {
                let capability = m.capability();
                m.monitored_flows().into_iter().map(move |f| (capability.clone(), f))
            })
            .collect()
    }

    fn owner(&self, flow: &Flow) -> Result<&Arc<dyn FlowMonitor>, ValidationError> {
        let mut reasons = Vec::with_capacity(self.monitors.len());
        for monitor in &self.monitors {
            match monitor.validate_flow(flow) {
                Ok(()) => return Ok(monitor),
                Err(e) => reasons.push(e.to_string()),
            }
        }
        let reason = if reasons.is_empty() {
            "no monitoring capability available".to_string()
        } else {
            reasons.join("; ")
        };
        Err(ValidationError::NotMonitorable {
            flow: flow.to_string(),
            reason,
        })
    }
}
