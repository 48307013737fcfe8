// ============================================================================
// CONTROL SURFACE
// ============================================================================
// Line-oriented command interface over the monitoring facade. Every reply is
// one of three forms, which operator tooling parses:
//
//   STATUS: <message>                 state changed
//   STATUS: nothing done (<reason>)   idempotent no-op
//   ERROR: <message>                  the request was rejected
// ============================================================================

use std::fmt::{self, Display, Formatter};

use tracing::info;

use crate::facade::MonitoringFacade;
use crate::types::Flow;

const HELP: &str = "commands: start <flow>[;<flow>...], stop <flow>[;<flow>...], \
                    validate <flow>[;<flow>...], help";

/// Outcome of one control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    NothingDone(String),
    Error(String),
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(msg) => write!(f, "STATUS: {}", msg),
            Reply::NothingDone(reason) => write!(f, "STATUS: nothing done ({})", reason),
            Reply::Error(msg) => write!(f, "ERROR: {}", msg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlSurface {
    facade: MonitoringFacade,
}

impl ControlSurface {
    pub fn new(facade: MonitoringFacade) -> Self {
        Self { facade }
    }

    /// Run one command line and render its reply.
    pub fn execute(&self, line: &str) -> String {
        self.handle(line).to_string()
    }

    pub fn handle(&self, line: &str) -> Reply {
        let line = line.trim();
        let (command, args) = line
            .split_once(char::is_whitespace)
            .map(|(c, a)| (c, a.trim()))
            .unwrap_or((line, ""));

        let reply = match command.to_ascii_lowercase().as_str() {
            "start" => self.start(args),
            "stop" => self.stop(args),
            "validate" => self.validate(args),
            "help" => Reply::Status(HELP.to_string()),
            "" => Reply::NothingDone("no command provided".to_string()),
            other => Reply::Error(format!("unknown command '{}'", other)),
        };
        info!(target: "flowwatch::control", command = line, reply = %reply, "Control command");
        reply
    }

    fn start(&self, args: &str) -> Reply {
        let flows = match parse_flows(args) {
            Ok(Some(flows)) => flows,
            Ok(None) => return Reply::NothingDone("no flows provided".to_string()),
            Err(reply) => return reply,
        };
        if let Err(reply) = self.validate_all(&flows) {
            return reply;
        }

        let mut changed = false;
        for flow in &flows {
            match self.facade.start_monitoring(flow) {
                Ok(c) => changed |= c,
                Err(e) => return Reply::Error(e.to_string()),
            }
        }
        if changed {
            Reply::Status("monitoring started".to_string())
        } else {
            Reply::NothingDone("monitoring is already started".to_string())
        }
    }

    fn stop(&self, args: &str) -> Reply {
        let flows = match parse_flows(args) {
            Ok(Some(flows)) => flows,
            Ok(None) => return Reply::NothingDone("no flows provided".to_string()),
            Err(reply) => return reply,
        };
        if let Err(reply) = self.validate_all(&flows) {
            return reply;
        }

        let mut changed = false;
        for flow in &flows {
            match self.facade.stop_monitoring(flow) {
                Ok(c) => changed |= c,
                Err(e) => return Reply::Error(e.to_string()),
            }
        }
        if changed {
            Reply::Status("monitoring stopped".to_string())
        } else {
            Reply::NothingDone("monitoring is already stopped".to_string())
        }
    }

    fn validate(&self, args: &str) -> Reply {
        match parse_flows(args) {
            Ok(Some(flows)) => match self.validate_all(&flows) {
                Ok(()) => Reply::Status("flows are monitorable".to_string()),
                Err(reply) => reply,
            },
            Ok(None) => Reply::NothingDone("no flows provided".to_string()),
            Err(reply) => reply,
        }
    }

    /// Nothing is started or stopped unless every flow is monitorable.
    fn validate_all(&self, flows: &[Flow]) -> Result<(), Reply> {
        flows
            .iter()
            .try_for_each(|flow| self.facade.validate_monitorable_flow(flow))
            .map_err(|e| Reply::Error(e.to_string()))
    }
}

/// `None` when no flow text was given at all.
fn parse_flows(args: &str) -> Result<Option<Vec<Flow>>, Reply> {
    if args.is_empty() {
        return Ok(None);
    }
    args.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Flow>().map_err(|e| Reply::Error(e.to_string())))
        .collect::<Result<Vec<_>, _>>()
        .map(|flows| if flows.is_empty() { None } else { Some(flows) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::facade::FlowMonitor;
    use crate::lifecycle::{capabilities, Capability};
    use crate::types::MatchField;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::collections::HashSet;
    use std::sync::Arc;

    /// Monitors anything except flows constraining `in_port`.
    #[derive(Debug, Default)]
    struct PortlessMonitor {
        flows: Mutex<HashSet<Flow>>,
    }

    impl FlowMonitor for PortlessMonitor {
        fn capability(&self) -> Capability {
            capabilities::SAMPLING
        }

        fn validate_flow(&self, flow: &Flow) -> Result<(), ValidationError> {
            if flow.constrains(MatchField::InPort) {
                Err(ValidationError::NotSamplable {
                    reason: "in_port is not allowed".into(),
                })
            } else {
                Ok(())
            }
        }

        fn start_monitoring(&self, flow: &Flow) -> Result<bool, ValidationError> {
            Ok(self.flows.lock().insert(flow.clone()))
        }

        fn stop_monitoring(&self, flow: &Flow) -> Result<bool, ValidationError> {
            Ok(self.flows.lock().remove(flow))
        }

        fn is_monitoring(&self, flow: &Flow) -> bool {
            self.flows.lock().contains(flow)
        }

        fn monitored_flows(&self) -> Vec<Flow> {
            self.flows.lock().iter().cloned().collect()
        }
    }

    fn surface() -> ControlSurface {
        ControlSurface::new(MonitoringFacade::new(vec![Arc::new(PortlessMonitor::default()) as Arc<dyn FlowMonitor>]))
    }

    #[test]
    fn test_start_twice_reports_nothing_done() {
        let surface = surface();
        assert_eq!(surface.execute("start eth_type=0x0800"), "STATUS: monitoring started");
        assert_eq!(
            surface.execute("start eth_type=2048"),
            "STATUS: nothing done (monitoring is already started)"
        );
        assert_eq!(surface.execute("stop eth_type=0x0800"), "STATUS: monitoring stopped");
        assert_eq!(
            surface.execute("stop eth_type=0x0800"),
            "STATUS: nothing done (monitoring is already stopped)"
        );
    }

    #[test]
    fn test_multiple_flows_report_any_change() {
        let surface = surface();
        surface.execute("start eth_type=0x0800");
        assert_eq!(
            surface.execute("start eth_type=0x0800; eth_type=0x0806"),
            "STATUS: monitoring started"
        );
    }

    #[test]
    fn test_invalid_flow_changes_nothing() {
        let surface = surface();
        let reply = surface.execute("start eth_type=0x0800;in_port=1");
        assert!(reply.starts_with("ERROR: "), "{}", reply);
        assert!(!surface.facade.is_monitoring(&"eth_type=0x0800".parse().unwrap()));
    }

    #[rstest]
    #[case("", "STATUS: nothing done (no command provided)")]
    #[case("start", "STATUS: nothing done (no flows provided)")]
    #[case("stop  ;  ", "STATUS: nothing done (no flows provided)")]
    #[case("validate ipv4_dst=10.0.0.2", "STATUS: flows are monitorable")]
    #[case("frobnicate", "ERROR: unknown command 'frobnicate'")]
    fn test_replies(#[case] line: &str, #[case] expected: &str) {
        assert_eq!(surface().execute(line), expected);
    }

    #[test]
    fn test_help_and_parse_errors() {
        let surface = surface();
        assert!(surface.execute("help").starts_with("STATUS: commands:"));
        assert!(surface.handle("start bogus").is_error());
        assert!(surface.handle("start eth_type=banana,ipv4_dst=not-an-ip").is_error());
        assert!(surface.facade.monitored_flows().is_empty());
    }
}
