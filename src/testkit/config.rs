//! Canonical configurations for timing-sensitive tests.
//!
//! Intervals are short enough that a scenario spanning several probe
//! sweeps still finishes in well under a second.

use crate::config::{Config, FailoverConfig, ManagerConfig, MetricsConfig};

/// Failover tuned for tests: 25ms probes, two-probe hysteresis.
pub fn fast_failover() -> FailoverConfig {
    FailoverConfig {
        enabled: true,
        health_check_interval_ms: 25,
        failure_threshold: 2,
        recovery_threshold: 2,
        max_latency_ms: 500,
        probe_timeout_ms: 250,
        auto_recover: false,
    }
}

/// Manager settings with short provider deadlines.
pub fn fast_manager() -> ManagerConfig {
    ManagerConfig {
        provider_timeout_ms: 2_000,
        shutdown_grace_ms: 250,
        event_buffer: 64,
    }
}

/// Metrics collection effectively parked so TCP probes never interfere;
/// tests that want collection call it explicitly or shrink the interval.
pub fn quiet_metrics() -> MetricsConfig {
    MetricsConfig {
        interval_ms: 60_000,
        probe_timeout_ms: 500,
        history_size: 10,
    }
}

/// The standard test configuration: fast failover, quiet metrics.
pub fn fast_config() -> Config {
    Config {
        manager: fast_manager(),
        failover: fast_failover(),
        metrics: quiet_metrics(),
        logging: Default::default(),
    }
}
