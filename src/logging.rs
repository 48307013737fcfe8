// ============================================================================
// LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging through `tracing`. Components never hold a logger; they
// emit events under a `flowwatch::<component>` target and the subscriber
// installed here decides what is kept.
// ============================================================================

use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{MonitorError, MonitorResult};

/// Log targets used across the engine
pub mod targets {
    pub const INIT: &str = "flowwatch::init";
    pub const CORRELATOR: &str = "flowwatch::correlator";
    pub const COLLECTORS: &str = "flowwatch::collectors";
    pub const SAMPLING: &str = "flowwatch::sampling";
    pub const PROBING: &str = "flowwatch::probing";
    pub const ORCHESTRATOR: &str = "flowwatch::orchestrator";
    pub const FACADE: &str = "flowwatch::facade";
    pub const CONTROL: &str = "flowwatch::control";
    pub const TOPOLOGY: &str = "flowwatch::topology";
}

fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> MonitorResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    // Logs go to stderr; stdout carries the control surface replies.
    let result = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    result.map_err(|e| MonitorError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: targets::INIT,
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// Logging Macros for Engine Components
// ----------------------------------------------------------------------------

/// Log a measurement request lifecycle event
#[macro_export]
macro_rules! log_collection {
    ($event:expr, $key:expr) => {
        tracing::debug!(
            target: "flowwatch::correlator",
            event = $event,
            key = %$key,
            "Collection {}", $event
        )
    };
    ($event:expr, $key:expr, $($field:tt)*) => {
        tracing::debug!(
            target: "flowwatch::correlator",
            event = $event,
            key = %$key,
            $($field)*,
            "Collection {}", $event
        )
    };
}

/// Log a submodule lifecycle transition
#[macro_export]
macro_rules! log_lifecycle {
    ($submodule:expr, $state:expr) => {
        tracing::info!(
            target: "flowwatch::orchestrator",
            submodule = %$submodule,
            state = %$state,
            "Submodule transitioned"
        )
    };
}
