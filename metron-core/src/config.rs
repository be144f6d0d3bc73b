//! Configuration types for the Metron profiler

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default sample rate when none is configured (10% of transactions)
pub const DEFAULT_SAMPLE_RATE: f64 = 0.1;

/// Main configuration for the profiler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilerConfig {
    /// Service name reported with every transaction (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Default sample rate in the range 0.0..=1.0
    pub sample_rate: f64,

    /// Record wall time for every transaction, even unsampled ones
    pub always_on_wall_time: bool,

    /// API key forwarded to the collector (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Transport configuration
    pub transport: TransportConfig,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            service_name: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            always_on_wall_time: false,
            api_key: None,
            transport: TransportConfig::default(),
        }
    }
}

/// Transport configuration for the collector daemon connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Unix socket path of the local collector daemon
    pub socket_path: PathBuf,

    /// Write timeout for a single payload
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Bounded handoff queue depth; payloads are dropped when full
    pub queue_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/metron/metrond.sock"),
            write_timeout: Duration::from_millis(250),
            queue_size: 64,
        }
    }
}

impl ProfilerConfig {
    /// Load configuration from `metron.toml` and `METRON_`-prefixed
    /// environment variables, with env taking precedence.
    pub fn from_env() -> crate::error::Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Toml},
        };

        let mut figment = Figment::new()
            .merge(Toml::file("metron.toml"))
            .merge(Env::prefixed("METRON_").split("_"));

        // Check for custom config path
        if let Ok(path) = std::env::var("METRON_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: ProfilerConfig = figment.extract().map_err(|e| {
            crate::error::MetronError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Toml},
        };

        let config: ProfilerConfig = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                crate::error::MetronError::Configuration(format!(
                    "Failed to load configuration file: {}",
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate structural configuration values.
    ///
    /// An out-of-range sample rate is not an error here: by contract it is
    /// logged and replaced by the default at decision time.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.transport.socket_path.as_os_str().is_empty() {
            return Err(crate::error::MetronError::Configuration(
                "transport.socket_path must not be empty".to_string(),
            ));
        }

        if self.transport.queue_size == 0 {
            return Err(crate::error::MetronError::Configuration(
                "transport.queue_size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// The sample rate with the configuration-error fallback applied.
    ///
    /// NaN or out-of-range values fall back to [`DEFAULT_SAMPLE_RATE`].
    pub fn effective_sample_rate(&self) -> f64 {
        sanitize_rate(self.sample_rate)
    }
}

/// Apply the configuration-error policy to a sample rate value.
///
/// Returns the rate unchanged when it is finite and within 0.0..=1.0,
/// otherwise logs a warning and returns [`DEFAULT_SAMPLE_RATE`].
pub fn sanitize_rate(rate: f64) -> f64 {
    if rate.is_finite() && (0.0..=1.0).contains(&rate) {
        rate
    } else {
        tracing::warn!(rate, "invalid sample rate, falling back to default");
        DEFAULT_SAMPLE_RATE
    }
}
