// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem in the engine, grouped by how the caller is
// expected to react:
// - composition errors halt startup
// - validation errors reject a single call
// - collection errors fail a single pending result
// ============================================================================

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::Capability;
use crate::types::{EndpointSide, NodeId};

// ----------------------------------------------------------------------------
// Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum MonitorError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Collector Agent Errors ----
    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    // ---- Measurement Request Errors ----
    #[error("Collection error: {0}")]
    Collection(#[from] CollectionError),

    // ---- Startup Errors ----
    #[error("Composition error: {0}")]
    Composition(#[from] CompositionError),

    // ---- Caller Input Errors ----
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MonitorError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            MonitorError::Config(_) => false,
            MonitorError::Collector(_) => true,
            MonitorError::Collection(e) => e.is_recoverable(),
            MonitorError::Composition(_) => false,
            MonitorError::Validation(_) => true,
            MonitorError::Io(_) => true,
            MonitorError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            MonitorError::Config(_) => "config",
            MonitorError::Collector(_) => "collector",
            MonitorError::Collection(_) => "collection",
            MonitorError::Composition(_) => "composition",
            MonitorError::Validation(_) => "validation",
            MonitorError::Io(_) => "io",
            MonitorError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            MonitorError::Config(_) => RecoveryHint::FixConfiguration,
            MonitorError::Composition(_) => RecoveryHint::FixConfiguration,
            MonitorError::Collection(e) => e.recovery_hint(),
            MonitorError::Collector(_) => RecoveryHint::Reconnect,
            MonitorError::Validation(_) => RecoveryHint::FixRequest,
            MonitorError::Io(_) => RecoveryHint::RetryWithBackoff,
            MonitorError::Internal(_) => RecoveryHint::None,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry once the outstanding operation settles
    RetryLater,
    /// Reconnect the collector agent
    Reconnect,
    /// Fix the caller's input
    FixRequest,
    /// Fix configuration and restart
    FixConfiguration,
}

/// Result type used across the engine
pub type MonitorResult<T> = Result<T, MonitorError>;

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Collector Agent Errors
// ----------------------------------------------------------------------------

/// Errors from collector agent membership changes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectorError {
    #[error("Collector '{id}' is already connected")]
    DuplicateCollector { id: String },

    #[error("Collector '{id}' claims node {node}, which is already served by another collector")]
    DuplicateNode { id: String, node: NodeId },

    #[error("Collector '{id}' not found")]
    NotFound { id: String },
}

// ----------------------------------------------------------------------------
// Collection Errors
// ----------------------------------------------------------------------------

/// Reasons a single pending measurement result fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectionError {
    #[error("{target} is already being collected ({kind})")]
    Duplicate { target: String, kind: String },

    #[error("no collector is available for {side} node {node}")]
    MissingCollector { node: NodeId, side: EndpointSide },

    #[error("no reply before the deadline (waited {}ms)", waited.as_millis())]
    TimedOut { waited: Duration },

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("collection aborted: {reason}")]
    Aborted { reason: String },

    #[error("collection was cancelled")]
    Cancelled,
}

impl CollectionError {
    /// All collection errors leave the engine usable.
    pub fn is_recoverable(&self) -> bool {
        true
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            CollectionError::Duplicate { .. } => RecoveryHint::RetryLater,
            CollectionError::MissingCollector { .. } => RecoveryHint::Reconnect,
            CollectionError::TimedOut { .. } => RecoveryHint::RetryWithBackoff,
            CollectionError::Dispatch(_) => RecoveryHint::RetryWithBackoff,
            CollectionError::Aborted { .. } => RecoveryHint::Reconnect,
            CollectionError::Cancelled => RecoveryHint::None,
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        CollectionError::Aborted {
            reason: reason.into(),
        }
    }

    /// Short label used for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            CollectionError::Duplicate { .. } => "duplicate",
            CollectionError::MissingCollector { .. } => "missing_collector",
            CollectionError::TimedOut { .. } => "timed_out",
            CollectionError::Dispatch(_) => "dispatch",
            CollectionError::Aborted { .. } => "aborted",
            CollectionError::Cancelled => "cancelled",
        }
    }
}

/// Errors raised by the transport collaborator when handing off a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("outgoing request queue is full")]
    QueueFull,

    #[error("transport is closed")]
    Closed,

    #[error("request rejected: {reason}")]
    Rejected { reason: String },
}

// ----------------------------------------------------------------------------
// Composition Errors
// ----------------------------------------------------------------------------

/// Errors raised while composing and activating submodules. Always fatal.
#[derive(Error, Debug)]
pub enum CompositionError {
    #[error("submodule '{submodule}' depends on '{capability}', which nothing provides")]
    MissingDependency {
        submodule: String,
        capability: Capability,
    },

    #[error(
        "submodule '{submodule}' depends on '{capability}', provided by '{provider}' which is ordered after it"
    )]
    DependencyOrder {
        submodule: String,
        capability: Capability,
        provider: String,
    },

    #[error("capability '{capability}' is provided by both '{first}' and '{second}'")]
    DuplicateCapability {
        capability: Capability,
        first: String,
        second: String,
    },

    #[error("submodule '{submodule}' failed to initialize: {source}")]
    InitFailed {
        submodule: String,
        #[source]
        source: SubmoduleError,
    },

    #[error("submodule '{submodule}' failed to start up: {source}")]
    StartFailed {
        submodule: String,
        #[source]
        source: SubmoduleError,
    },

    #[error("submodules were already composed")]
    AlreadyComposed,
}

/// Errors a submodule may return from `init` or `start_up`.
#[derive(Error, Debug)]
pub enum SubmoduleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no implementation registered for capability '{capability}'")]
    MissingService { capability: Capability },

    #[error("capability '{capability}' is registered with an unexpected type")]
    ServiceTypeMismatch { capability: Capability },

    #[error("{message}")]
    Failed { message: String },
}

impl SubmoduleError {
    pub fn failed(message: impl Into<String>) -> Self {
        SubmoduleError::Failed {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Validation Errors
// ----------------------------------------------------------------------------

/// Caller-visible rejections of invalid input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid {what} '{input}': {reason}")]
    Parse {
        what: &'static str,
        input: String,
        reason: String,
    },

    #[error("invalid samplable flow: {reason}")]
    NotSamplable { reason: String },

    #[error("invalid probable flow: {reason}")]
    NotProbable { reason: String },

    #[error("flow {flow} cannot be monitored: {reason}")]
    NotMonitorable { flow: String, reason: String },
}

impl ValidationError {
    pub fn parse(what: &'static str, input: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::Parse {
            what,
            input: input.into(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_errors_are_recoverable() {
        let err: MonitorError = CollectionError::TimedOut {
            waited: Duration::from_millis(2500),
        }
        .into();
        assert!(err.is_recoverable());
        assert_eq!(err.category(), "collection");
        assert_eq!(err.recovery_hint(), RecoveryHint::RetryWithBackoff);
        assert_eq!(
            err.to_string(),
            "Collection error: no reply before the deadline (waited 2500ms)"
        );
    }

    #[test]
    fn test_composition_errors_are_fatal() {
        let err: MonitorError = CompositionError::MissingDependency {
            submodule: "link-sampling".into(),
            capability: Capability::new("probing"),
        }
        .into();
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::FixConfiguration);
    }

    #[test]
    fn test_dispatch_error_converts_into_collection_error() {
        let err: CollectionError = DispatchError::QueueFull.into();
        assert_eq!(err.label(), "dispatch");
        assert_eq!(err.to_string(), "dispatch failed: outgoing request queue is full");
    }
}
