// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (FLOWWATCH_ prefix, `__` between sections)
// - Validation
// - Sensible defaults for every field
// ============================================================================

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::Flow;
use crate::{
    DEFAULT_COLLECTOR_LOCAL_PORT, DEFAULT_DEADLINE_MARGIN_MS, DEFAULT_IDLE_SLEEP_MS, DEFAULT_MAX_ROUND_DURATION_MS,
    DEFAULT_MIN_ROUND_DURATION_MS, DEFAULT_PROBE_ETH_TYPE, DEFAULT_SAMPLING_PORT, ENGINE_NAME,
};

/// Highest valid (non-reserved) OpenFlow port number
const OFPP_MAX: u32 = 0xffff_ff00;

// ----------------------------------------------------------------------------
// Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: GeneralConfig,

    #[serde(default)]
    pub collector_handler: CollectorHandlerConfig,

    #[serde(default)]
    pub sampling: SamplingConfig,

    #[serde(default)]
    pub probing: ProbingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("FLOWWATCH_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.collector_handler.validate()?;
        validate_round("sampling", self.sampling.min_round_duration, self.sampling.max_round_duration)?;
        validate_round("probing", self.probing.min_round_duration, self.probing.max_round_duration)?;

        if self.sampling.max_simultaneous_samplings == 0 {
            return Err(ConfigError::invalid_value(
                "sampling.max_simultaneous_samplings",
                "must be at least 1",
            ));
        }
        if self.probing.max_simultaneous_probings == 0 {
            return Err(ConfigError::invalid_value(
                "probing.max_simultaneous_probings",
                "must be at least 1",
            ));
        }

        match self.logging.format.as_str() {
            "json" | "compact" | "pretty" => Ok(()),
            other => Err(ConfigError::invalid_value(
                "logging.format",
                format!("unknown format '{}' (expected json, compact or pretty)", other),
            )),
        }
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

fn validate_round(section: &str, min: Duration, max: Duration) -> Result<(), ConfigError> {
    if min.is_zero() {
        return Err(ConfigError::invalid_value(
            format!("{}.min_round_duration", section),
            "must be positive",
        ));
    }
    if min > max {
        return Err(ConfigError::invalid_value(
            format!("{}.max_round_duration", section),
            format!(
                "must not be lower than min_round_duration ({})",
                humantime::format_duration(min)
            ),
        ));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// General Engine Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// How long `shutdown` waits for background loops before aborting them
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_instance_name() -> String {
    ENGINE_NAME.into()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

// ----------------------------------------------------------------------------
// Collector Handler Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorHandlerConfig {
    /// TCP port collector agents connect to
    #[serde(default = "default_local_port")]
    pub local_port: u16,

    /// OpenFlow port through which sampled packets are mirrored
    #[serde(default = "default_sampling_port")]
    pub sampling_port: u32,

    /// Added to every collection duration to form the request deadline
    #[serde(default = "default_deadline_margin", with = "humantime_serde")]
    pub deadline_margin: Duration,
}

impl Default for CollectorHandlerConfig {
    fn default() -> Self {
        Self {
            local_port: default_local_port(),
            sampling_port: default_sampling_port(),
            deadline_margin: default_deadline_margin(),
        }
    }
}

impl CollectorHandlerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_port == 0 {
            return Err(ConfigError::invalid_value(
                "collector_handler.local_port",
                "must be a non-zero TCP port",
            ));
        }
        if self.sampling_port == 0 || self.sampling_port > OFPP_MAX {
            return Err(ConfigError::invalid_value(
                "collector_handler.sampling_port",
                format!("must be a physical OpenFlow port in 1..={:#x}", OFPP_MAX),
            ));
        }
        Ok(())
    }
}

fn default_local_port() -> u16 {
    DEFAULT_COLLECTOR_LOCAL_PORT
}

fn default_sampling_port() -> u32 {
    DEFAULT_SAMPLING_PORT
}

fn default_deadline_margin() -> Duration {
    Duration::from_millis(DEFAULT_DEADLINE_MARGIN_MS)
}

// ----------------------------------------------------------------------------
// Sampling & Probing Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_min_round", with = "humantime_serde")]
    pub min_round_duration: Duration,

    #[serde(default = "default_max_round", with = "humantime_serde")]
    pub max_round_duration: Duration,

    /// Upper bound on sampling requests in flight during one round
    #[serde(default = "default_simultaneous")]
    pub max_simultaneous_samplings: usize,

    /// Pause between rounds when nothing is monitored
    #[serde(default = "default_idle_sleep", with = "humantime_serde")]
    pub idle_sleep: Duration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            min_round_duration: default_min_round(),
            max_round_duration: default_max_round(),
            max_simultaneous_samplings: default_simultaneous(),
            idle_sleep: default_idle_sleep(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbingConfig {
    #[serde(default = "default_min_round", with = "humantime_serde")]
    pub min_round_duration: Duration,

    #[serde(default = "default_max_round", with = "humantime_serde")]
    pub max_round_duration: Duration,

    /// Ethertype of secure probe packets
    #[serde(default = "default_probe_eth_type")]
    pub probe_eth_type: u16,

    #[serde(default = "default_simultaneous")]
    pub max_simultaneous_probings: usize,

    #[serde(default = "default_idle_sleep", with = "humantime_serde")]
    pub idle_sleep: Duration,
}

impl Default for ProbingConfig {
    fn default() -> Self {
        Self {
            min_round_duration: default_min_round(),
            max_round_duration: default_max_round(),
            probe_eth_type: default_probe_eth_type(),
            max_simultaneous_probings: default_simultaneous(),
            idle_sleep: default_idle_sleep(),
        }
    }
}

impl SamplingConfig {
    /// Collection duration for the next round.
    pub fn round_duration(&self) -> Duration {
        pick_round_duration(self.min_round_duration, self.max_round_duration)
    }
}

impl ProbingConfig {
    pub fn round_duration(&self) -> Duration {
        pick_round_duration(self.min_round_duration, self.max_round_duration)
    }

    /// The flow every secure probe packet matches.
    pub fn probe_base_flow(&self) -> Flow {
        Flow::eth_type(self.probe_eth_type)
    }
}

/// Uniformly random duration in `[min, max]`, at millisecond granularity.
pub fn pick_round_duration(min: Duration, max: Duration) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = (max.as_millis() as u64).max(min_ms);
    Duration::from_millis(fastrand::u64(min_ms..=max_ms))
}

fn default_min_round() -> Duration {
    Duration::from_millis(DEFAULT_MIN_ROUND_DURATION_MS)
}

fn default_max_round() -> Duration {
    Duration::from_millis(DEFAULT_MAX_ROUND_DURATION_MS)
}

fn default_simultaneous() -> usize {
    1
}

fn default_idle_sleep() -> Duration {
    Duration::from_millis(DEFAULT_IDLE_SLEEP_MS)
}

fn default_probe_eth_type() -> u16 {
    DEFAULT_PROBE_ETH_TYPE
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config_validates() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.collector_handler.sampling_port, 65000);
        assert_eq!(config.collector_handler.deadline_margin, Duration::from_secs(2));
        assert_eq!(config.probing.probe_base_flow().to_string(), "eth_type=0x88b5");
    }

    #[test]
    fn test_from_toml_str_reads_humantime_durations() {
        let config = EngineConfig::from_toml_str(
            r#"
            [collector_handler]
            sampling_port = 42
            deadline_margin = "750ms"

            [sampling]
            min_round_duration = "3s"
            max_round_duration = "5s"
            max_simultaneous_samplings = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.collector_handler.sampling_port, 42);
        assert_eq!(config.collector_handler.deadline_margin, Duration::from_millis(750));
        assert_eq!(config.sampling.max_round_duration, Duration::from_secs(5));
        assert_eq!(config.sampling.max_simultaneous_samplings, 4);
        assert_eq!(config.probing, ProbingConfig::default());
    }

    #[test]
    fn test_inverted_round_bounds_are_rejected() {
        let err = EngineConfig::from_toml_str(
            r#"
            [probing]
            min_round_duration = "4s"
            max_round_duration = "2s"
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "probing.max_round_duration"));
    }

    #[test]
    fn test_zero_sampling_port_is_rejected() {
        let err = EngineConfig::from_toml_str("[collector_handler]\nsampling_port = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "collector_handler.sampling_port"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\ninstance_name = \"edge-1\"\n[logging]\nformat = \"json\"").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.engine.instance_name, "edge-1");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_round_duration_stays_in_range() {
        let sampling = SamplingConfig::default();
        for _ in 0..100 {
            let d = sampling.round_duration();
            assert!(d >= sampling.min_round_duration && d <= sampling.max_round_duration);
        }
        let fixed = pick_round_duration(Duration::from_secs(3), Duration::from_secs(3));
        assert_eq!(fixed, Duration::from_secs(3));
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_generated_default_config_round_trips() {
        let text = EngineConfig::generate_default_config();
        let parsed = EngineConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, EngineConfig::default());
    }
}
