//! Per-connection health bookkeeping.
//!
//! The dual threshold (failure vs recovery) is deliberate hysteresis: one
//! knob produces primary flapping under intermittent packet loss.

use chrono::{DateTime, Utc};

/// Probe history for one connection, owned by the failover controller.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_check: DateTime<Utc>,
    pub healthy: bool,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_check: Utc::now(),
            healthy: true,
        }
    }
}

/// What one probe observation did to a connection's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeOutcome {
    /// Healthy and the probe succeeded.
    StillHealthy,
    /// Healthy but accumulating failures below the threshold.
    Degrading,
    /// Failure streak just reached the threshold.
    BecameUnhealthy,
    /// Already unhealthy, probe failed again.
    StillUnhealthy,
    /// Unhealthy but accumulating successes below the threshold.
    Recovering,
    /// Success streak just reached the recovery threshold.
    Recovered,
}

impl HealthStatus {
    /// Fold one probe result into the streak counters.
    pub(crate) fn observe(
        &mut self,
        success: bool,
        failure_threshold: u32,
        recovery_threshold: u32,
    ) -> ProbeOutcome {
        self.last_check = Utc::now();

        if success {
            self.consecutive_failures = 0;
            if self.healthy {
                return ProbeOutcome::StillHealthy;
            }
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            if self.consecutive_successes >= recovery_threshold {
                self.healthy = true;
                self.consecutive_successes = 0;
                return ProbeOutcome::Recovered;
            }
            ProbeOutcome::Recovering
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.healthy {
                if self.consecutive_failures >= failure_threshold {
                    self.healthy = false;
                    return ProbeOutcome::BecameUnhealthy;
                }
                return ProbeOutcome::Degrading;
            }
            ProbeOutcome::StillUnhealthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_until_threshold() {
        let mut health = HealthStatus::default();

        assert_eq!(health.observe(false, 3, 2), ProbeOutcome::Degrading);
        assert_eq!(health.observe(false, 3, 2), ProbeOutcome::Degrading);
        assert!(health.healthy);
        assert_eq!(health.observe(false, 3, 2), ProbeOutcome::BecameUnhealthy);
        assert!(!health.healthy);
        assert_eq!(health.consecutive_failures, 3);
    }

    #[test]
    fn success_clears_a_failure_streak() {
        let mut health = HealthStatus::default();
        health.observe(false, 3, 2);
        health.observe(false, 3, 2);

        assert_eq!(health.observe(true, 3, 2), ProbeOutcome::StillHealthy);
        assert_eq!(health.consecutive_failures, 0);

        // The streak starts over; two more failures are not enough.
        assert_eq!(health.observe(false, 3, 2), ProbeOutcome::Degrading);
        assert_eq!(health.observe(false, 3, 2), ProbeOutcome::Degrading);
        assert!(health.healthy);
    }

    #[test]
    fn recovery_requires_sustained_success() {
        let mut health = HealthStatus::default();
        health.observe(false, 1, 2);
        assert!(!health.healthy);

        assert_eq!(health.observe(true, 1, 2), ProbeOutcome::Recovering);
        // An interleaved failure resets the success streak.
        assert_eq!(health.observe(false, 1, 2), ProbeOutcome::StillUnhealthy);
        assert_eq!(health.observe(true, 1, 2), ProbeOutcome::Recovering);
        assert_eq!(health.observe(true, 1, 2), ProbeOutcome::Recovered);
        assert!(health.healthy);
    }

    #[test]
    fn thresholds_of_one_flip_immediately() {
        let mut health = HealthStatus::default();
        assert_eq!(health.observe(false, 1, 1), ProbeOutcome::BecameUnhealthy);
        assert_eq!(health.observe(true, 1, 1), ProbeOutcome::Recovered);
        assert!(health.healthy);
    }
}
