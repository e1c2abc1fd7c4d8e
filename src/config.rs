//! Configuration management for quotaguard.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{QuotaError, Result};
use crate::ratelimit::Algorithm;

/// Default admissions per window.
const DEFAULT_CAPACITY: u64 = 10;
/// Default window length.
const DEFAULT_WINDOW: Duration = Duration::from_secs(1);
/// Default idle time before a registry entry is evicted.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// Default interval between idle sweeps.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Environment variable prefix for layered configuration.
pub const ENV_PREFIX: &str = "QUOTAGUARD";

/// Top-level configuration: one limiter template plus registry settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaGuardConfig {
    /// Limiter configuration, also the template for registry entries
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Keyed registry configuration
    #[serde(default)]
    pub registry: RegistryOptions,
}

/// Configuration for a single limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum admissions per window
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Window length
    #[serde(rename = "window_ms", with = "millis", default = "default_window")]
    pub window: Duration,

    /// Admission algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Give the admission back when the operation succeeds
    #[serde(default)]
    pub refund_on_success: bool,

    /// Give the admission back when the operation fails
    #[serde(default)]
    pub refund_on_failure: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            window: default_window(),
            algorithm: Algorithm::default(),
            refund_on_success: false,
            refund_on_failure: false,
        }
    }
}

impl LimiterConfig {
    /// Create a configuration with no refunds.
    pub fn new(capacity: u64, window: Duration, algorithm: Algorithm) -> Self {
        Self {
            capacity,
            window,
            algorithm,
            refund_on_success: false,
            refund_on_failure: false,
        }
    }

    /// Sliding window limiter.
    pub fn sliding_window(capacity: u64, window: Duration) -> Self {
        Self::new(capacity, window, Algorithm::SlidingWindow)
    }

    /// Fixed window limiter.
    pub fn fixed_window(capacity: u64, window: Duration) -> Self {
        Self::new(capacity, window, Algorithm::FixedWindow)
    }

    /// Token bucket limiter.
    pub fn token_bucket(capacity: u64, window: Duration) -> Self {
        Self::new(capacity, window, Algorithm::TokenBucket)
    }

    /// Set refund behavior.
    pub fn with_refunds(mut self, on_success: bool, on_failure: bool) -> Self {
        self.refund_on_success = on_success;
        self.refund_on_failure = on_failure;
        self
    }

    /// Reject configurations that cannot admit anything.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(QuotaError::Config(
                "capacity must be greater than zero".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(QuotaError::Config(
                "window duration must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryOptions {
    /// Entries untouched for this long are evicted by the sweep
    #[serde(rename = "idle_timeout_ms", with = "millis", default = "default_idle_timeout")]
    pub idle_timeout: Duration,

    /// How often the background sweep runs; `None` disables it
    #[serde(
        rename = "sweep_interval_ms",
        with = "opt_millis",
        default = "default_sweep_interval"
    )]
    pub sweep_interval: Option<Duration>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl RegistryOptions {
    /// Options with an idle timeout and no background sweep.
    pub fn manual(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            sweep_interval: None,
        }
    }

    /// Check that the sweep settings are usable.
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout.is_zero() {
            return Err(QuotaError::Config(
                "idle timeout must be greater than zero".to_string(),
            ));
        }
        if matches!(self.sweep_interval, Some(interval) if interval.is_zero()) {
            return Err(QuotaError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_capacity() -> u64 {
    DEFAULT_CAPACITY
}

fn default_window() -> Duration {
    DEFAULT_WINDOW
}

fn default_idle_timeout() -> Duration {
    DEFAULT_IDLE_TIMEOUT
}

fn default_sweep_interval() -> Option<Duration> {
    Some(DEFAULT_SWEEP_INTERVAL)
}

impl QuotaGuardConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading quotaguard configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: QuotaGuardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| QuotaError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, then apply
    /// `QUOTAGUARD__SECTION__FIELD` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading quotaguard configuration");
            builder = builder.add_source(::config::File::from(path));
        }
        let config: QuotaGuardConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| QuotaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()?;
        self.registry.validate()
    }
}

/// `Duration` as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `Option<Duration>` as integer milliseconds, `null` for none.
mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
