//! # Flowwatch Engine - Measurement Core of the SDN Controller
//!
//! Issues sampling (passive) and probing (active) measurement requests toward
//! per-node collector agents, correlates their asynchronous replies back to
//! the request that caused them, and exposes an always-consistent view of
//! which flows are being measured.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           FLOWWATCH ENGINE                                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  CONTROL SURFACE → MONITORING FACADE → ORCHESTRATOR → SUBMODULES            │
//! │                                                                             │
//! │  collector-handler ─┬─ collector registry (who can measure where)           │
//! │                     └─ request correlator (who is waiting for what)         │
//! │  link-probing      ── secure probes over every known link                   │
//! │  link-sampling     ── trajectory sampling of the monitored flows            │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`orchestrator::SubmoduleOrchestrator`] drives every submodule through
//! `init` then `start_up` in a fixed, author-declared order. The
//! [`facade::MonitoringFacade`] is the only thing the rest of the controller
//! is expected to talk to.

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod control;
pub mod correlator;
pub mod engine;
pub mod error;
pub mod facade;
pub mod handler;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod probing;
pub mod registry;
pub mod sample;
pub mod sampling;
pub mod topology;
pub mod transport;
pub mod types;

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version from Cargo.toml
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short engine name, used in log targets and banners
pub const ENGINE_NAME: &str = "flowwatch-engine";

/// Human-readable engine name
pub const ENGINE_FULL_NAME: &str = "Flowwatch Measurement Engine";

/// Default TCP port on which collector agents connect to the controller
pub const DEFAULT_COLLECTOR_LOCAL_PORT: u16 = 32800;

/// Default OpenFlow port used to mirror sampled packets toward collectors
pub const DEFAULT_SAMPLING_PORT: u32 = 65000;

/// Grace margin added to every collection duration to form its deadline.
/// Covers network latency and agent-side processing.
pub const DEFAULT_DEADLINE_MARGIN_MS: u64 = 2_000;

/// Ethertype carried by secure probe packets
pub const DEFAULT_PROBE_ETH_TYPE: u16 = 0x88b5;

/// Default lower bound of a sampling/probing round
pub const DEFAULT_MIN_ROUND_DURATION_MS: u64 = 1_000;

/// Default upper bound of a sampling/probing round
pub const DEFAULT_MAX_ROUND_DURATION_MS: u64 = 2_000;

/// How long round loops sleep when nothing is scheduled
pub const DEFAULT_IDLE_SLEEP_MS: u64 = 1_000;

/// Capacity of the outgoing request queue used by [`transport::ChannelDispatcher`]
pub const DISPATCH_QUEUE_CAPACITY: usize = 4096;

/// Capacity of the broadcast channels carrying samples and topology events
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Number of shards in the outstanding-request table
pub const CORRELATOR_SHARDS: usize = 64;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use config::EngineConfig;
pub use control::ControlSurface;
pub use correlator::{PendingResult, RequestCorrelator};
pub use engine::MonitoringEngine;
pub use error::{MonitorError, MonitorResult};
pub use facade::MonitoringFacade;
pub use handler::CollectorHandler;
pub use orchestrator::SubmoduleOrchestrator;
pub use sample::{Sample, SecureProbingSample, TrajectorySample};
pub use topology::{TopologyEvent, TopologyFeed};
pub use types::{BitMatch, DatapathLink, Flow, FlowedLink, NodeId, NodePort, PortId};
