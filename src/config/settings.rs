//! Settings for the connection manager and its background services.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::config::logging::LoggingConfig;
use crate::error::{Error, Result};

/// Top-level configuration, loadable from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read, is not valid TOML,
    /// or contains out-of-range values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &'static str, reason: &str| Error::InvalidConfig {
            field,
            reason: reason.to_string(),
        };

        if self.failover.health_check_interval_ms == 0 {
            return Err(invalid("failover.health_check_interval_ms", "must be > 0"));
        }
        if self.failover.failure_threshold == 0 {
            return Err(invalid("failover.failure_threshold", "must be >= 1"));
        }
        if self.failover.recovery_threshold == 0 {
            return Err(invalid("failover.recovery_threshold", "must be >= 1"));
        }
        if self.failover.probe_timeout_ms == 0 {
            return Err(invalid("failover.probe_timeout_ms", "must be > 0"));
        }
        if self.metrics.interval_ms == 0 {
            return Err(invalid("metrics.interval_ms", "must be > 0"));
        }
        if self.metrics.probe_timeout_ms == 0 {
            return Err(invalid("metrics.probe_timeout_ms", "must be > 0"));
        }
        if self.metrics.history_size == 0 {
            return Err(invalid("metrics.history_size", "must be > 0"));
        }
        if self.manager.provider_timeout_ms == 0 {
            return Err(invalid("manager.provider_timeout_ms", "must be > 0"));
        }
        if self.manager.event_buffer == 0 {
            return Err(invalid("manager.event_buffer", "must be > 0"));
        }
        Ok(())
    }
}

/// Connection manager settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Deadline for provider `connect`/`disconnect` calls.
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,
    /// Grace given to in-flight work during shutdown before it is aborted.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Per-subscriber event channel capacity.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

const fn default_provider_timeout_ms() -> u64 {
    30_000
}

const fn default_shutdown_grace_ms() -> u64 {
    500
}

const fn default_event_buffer() -> usize {
    32
}

impl ManagerConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            provider_timeout_ms: default_provider_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Failover controller settings. Immutable for the life of a manager except
/// for the runtime enable toggle.
#[derive(Debug, Clone, Deserialize)]
pub struct FailoverConfig {
    /// Master switch for automatic failover actions.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How often every connection is probed.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Consecutive failed probes before a connection is declared unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive successful probes before an unhealthy connection is
    /// considered recovered.
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
    /// Highest acceptable probe latency; slower connections fail the probe
    /// even when the provider reports healthy.
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    /// Deadline for one `is_healthy` call.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Whether a recovered connection with a better priority reclaims the
    /// primary slot.
    #[serde(default = "default_true")]
    pub auto_recover: bool,
}

const fn default_true() -> bool {
    true
}

const fn default_health_check_interval_ms() -> u64 {
    30_000
}

const fn default_failure_threshold() -> u32 {
    3
}

const fn default_recovery_threshold() -> u32 {
    2
}

const fn default_max_latency_ms() -> u64 {
    1_000
}

const fn default_probe_timeout_ms() -> u64 {
    2_000
}

impl FailoverConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_check_interval_ms: default_health_check_interval_ms(),
            failure_threshold: default_failure_threshold(),
            recovery_threshold: default_recovery_threshold(),
            max_latency_ms: default_max_latency_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            auto_recover: true,
        }
    }
}

/// Metrics collector settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// How often latency is measured.
    #[serde(default = "default_metrics_interval_ms")]
    pub interval_ms: u64,
    /// Deadline for one TCP latency probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Number of latency samples retained per connection.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

const fn default_metrics_interval_ms() -> u64 {
    5_000
}

const fn default_history_size() -> usize {
    10
}

impl MetricsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_metrics_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            history_size: default_history_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().expect("defaults are valid");
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.failover.enabled);
        assert_eq!(config.failover.failure_threshold, 3);
        assert_eq!(config.metrics.history_size, 10);
        assert_eq!(config.manager.event_buffer, 32);
    }

    #[test]
    fn partial_toml_overrides_selected_fields() {
        let raw = r#"
            [failover]
            failure_threshold = 1
            max_latency_ms = 250

            [metrics]
            interval_ms = 1000
        "#;
        let config: Config = toml::from_str(raw).unwrap();

        assert_eq!(config.failover.failure_threshold, 1);
        assert_eq!(config.failover.max_latency_ms, 250);
        assert_eq!(config.failover.recovery_threshold, 2);
        assert_eq!(config.metrics.interval_ms, 1000);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = Config {
            failover: FailoverConfig {
                health_check_interval_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("health_check_interval_ms"));
    }

    #[test]
    fn zero_thresholds_are_rejected() {
        let config = Config {
            failover: FailoverConfig {
                failure_threshold: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            failover: FailoverConfig {
                recovery_threshold: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_max_latency_is_allowed() {
        // A zero budget is a valid (if harsh) policy: no latency is ever
        // acceptable and every probed connection fails its checks.
        let config = Config {
            failover: FailoverConfig {
                max_latency_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        config.validate().expect("zero max latency is a policy");
    }
}
