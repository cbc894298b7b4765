//! Health probing and automatic primary failover.
//!
//! A background task probes every registered connection once per
//! `health_check_interval`: the provider's `is_healthy` plus a latency
//! budget check against what the metrics collector has cached. Streaks feed
//! the hysteresis state machine in [`health`]; crossing the failure
//! threshold marks the connection failed and, when it held the primary
//! slot, elects a replacement.
//!
//! Probes of distinct connections run concurrently; a connection is never
//! probed twice at once because the next sweep starts only after the
//! previous one finished. Elections are serialized by the registry.

mod health;

pub use health::HealthStatus;
use health::ProbeOutcome;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FailoverConfig;
use crate::domain::{Connection, ConnectionEvent, ConnectionId, ConnectionState, EventKind};
use crate::events::EventBus;
use crate::manager::registry::Registry;

pub(crate) struct FailoverController {
    config: FailoverConfig,
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    enabled: AtomicBool,
    health: DashMap<ConnectionId, HealthStatus>,
    total_failovers: AtomicU64,
}

impl FailoverController {
    pub(crate) fn new(config: FailoverConfig, registry: Arc<Registry>, bus: Arc<EventBus>) -> Self {
        let enabled = config.enabled;
        Self {
            config,
            registry,
            bus,
            enabled: AtomicBool::new(enabled),
            health: DashMap::new(),
            total_failovers: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            info!(enabled, "Auto-failover toggled");
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Begin tracking a newly registered connection as healthy.
    pub(crate) fn track(&self, id: &ConnectionId) {
        self.health.insert(id.clone(), HealthStatus::default());
    }

    pub(crate) fn untrack(&self, id: &ConnectionId) {
        self.health.remove(id);
    }

    pub(crate) fn health_of(&self, id: &ConnectionId) -> Option<HealthStatus> {
        self.health.get(id).map(|h| h.value().clone())
    }

    pub(crate) fn total_failovers(&self) -> u64 {
        self.total_failovers.load(Ordering::Relaxed)
    }

    /// Run the probe loop until the shutdown signal fires.
    ///
    /// An in-flight sweep always completes; shutdown only prevents the next
    /// one from starting.
    pub(crate) fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.health_check_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            debug!(
                interval_ms = self.config.health_check_interval_ms,
                "Failover controller started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => self.sweep().await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Failover controller stopped");
        })
    }

    /// Probe every registered connection once and apply the outcomes.
    pub(crate) async fn sweep(&self) {
        let connections = self.registry.connections();
        if connections.is_empty() {
            return;
        }

        let results = join_all(connections.iter().map(|c| self.probe(c))).await;

        for (conn, success) in connections.iter().zip(results) {
            let outcome = {
                let mut entry = self.health.entry(conn.id().clone()).or_default();
                entry.observe(
                    success,
                    self.config.failure_threshold,
                    self.config.recovery_threshold,
                )
            };
            self.apply(conn, outcome);
        }

        self.ensure_primary();
    }

    /// One probe: provider liveness AND the cached latency within budget.
    async fn probe(&self, conn: &Arc<Connection>) -> bool {
        let healthy = tokio::time::timeout(
            self.config.probe_timeout(),
            conn.provider().is_healthy(conn),
        )
        .await
        .unwrap_or(false);

        let latency_ok = conn.metrics().latency_ms() <= self.config.max_latency_ms;
        let success = healthy && latency_ok;
        if success {
            conn.touch();
        }
        success
    }

    fn apply(&self, conn: &Arc<Connection>, outcome: ProbeOutcome) {
        match outcome {
            ProbeOutcome::Degrading => {
                debug!(connection_id = %conn.id(), "Probe failed, degrading");
            }
            ProbeOutcome::BecameUnhealthy => self.on_unhealthy(conn),
            ProbeOutcome::Recovered => self.on_recovered(conn),
            ProbeOutcome::Recovering => {
                debug!(connection_id = %conn.id(), "Probe succeeded, recovering");
            }
            // A one-shot transition may fire while failover is disabled; the
            // steady states re-run the handlers whenever recorded health and
            // connection state disagree.
            ProbeOutcome::StillUnhealthy => {
                if self.is_enabled() && conn.state() == ConnectionState::Connected {
                    self.on_unhealthy(conn);
                }
            }
            ProbeOutcome::StillHealthy => {
                if conn.state() == ConnectionState::Failed {
                    self.on_recovered(conn);
                }
            }
        }
    }

    /// The failure streak just crossed the threshold.
    fn on_unhealthy(&self, conn: &Arc<Connection>) {
        let failures = self
            .health_of(conn.id())
            .map(|h| h.consecutive_failures)
            .unwrap_or(self.config.failure_threshold);
        warn!(
            connection_id = %conn.id(),
            method = conn.method(),
            failures,
            "Connection unhealthy"
        );

        if !self.is_enabled() {
            return;
        }

        let was_primary = conn.is_primary();
        let old_state = conn.set_state(ConnectionState::Failed);
        self.bus.publish(
            ConnectionEvent::for_connection(
                EventKind::StateChange,
                conn.id().clone(),
                "connection marked failed",
            )
            .with_data("from", old_state.to_string())
            .with_data("to", ConnectionState::Failed.to_string()),
        );
        self.bus.publish(
            ConnectionEvent::for_connection(
                EventKind::Error,
                conn.id().clone(),
                format!("{failures} consecutive failed health probes"),
            )
            .with_data("consecutive_failures", failures),
        );

        if was_primary {
            let new = self.registry.elect_primary(&self.bus);
            self.total_failovers.fetch_add(1, Ordering::Relaxed);
            self.bus.publish(
                ConnectionEvent::for_connection(
                    EventKind::Failover,
                    conn.id().clone(),
                    format!(
                        "primary {} failed, {}",
                        conn.id(),
                        new.as_ref()
                            .map(|n| format!("failing over to {}", n.id()))
                            .unwrap_or_else(|| "no candidate available".to_string())
                    ),
                )
                .with_data("from", conn.id().as_str())
                .with_data(
                    "to",
                    new.as_ref()
                        .map(|n| Value::from(n.id().as_str()))
                        .unwrap_or(Value::Null),
                )
                .with_data(
                    "reason",
                    format!("{failures} consecutive failed health probes"),
                ),
            );
        }
    }

    /// The success streak just crossed the recovery threshold.
    fn on_recovered(&self, conn: &Arc<Connection>) {
        info!(connection_id = %conn.id(), method = conn.method(), "Connection recovered");

        // Repair the state we set ourselves; anything else is not ours to touch.
        if conn.state() == ConnectionState::Failed {
            conn.set_state(ConnectionState::Connected);
            self.bus.publish(
                ConnectionEvent::for_connection(
                    EventKind::StateChange,
                    conn.id().clone(),
                    "connection recovered",
                )
                .with_data("from", ConnectionState::Failed.to_string())
                .with_data("to", ConnectionState::Connected.to_string()),
            );
        }

        if self.is_enabled() && self.config.auto_recover {
            self.registry.reclaim_primary(&self.bus, conn);
        }
    }

    /// Repair the primary invariant: a primary that is no longer Connected
    /// is replaced (or cleared) no later than the sweep that observes it,
    /// and an empty primary slot is filled when a Connected candidate
    /// exists.
    fn ensure_primary(&self) {
        match self.registry.current_primary() {
            Some(primary) => {
                if primary.state() != ConnectionState::Connected {
                    let _ = self.registry.elect_primary(&self.bus);
                }
            }
            None => {
                let has_candidate = self
                    .registry
                    .connections()
                    .iter()
                    .any(|c| c.state() == ConnectionState::Connected);
                if has_candidate {
                    let _ = self.registry.elect_primary(&self.bus);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailoverConfig;
    use crate::domain::Endpoint;
    use crate::provider::{ConnectConfig, TunnelProvider};
    use crate::testkit::MockProvider;

    fn controller_with(
        config: FailoverConfig,
    ) -> (Arc<FailoverController>, Arc<Registry>, Arc<EventBus>) {
        let registry = Arc::new(Registry::new());
        let bus = Arc::new(EventBus::new(64));
        let controller = Arc::new(FailoverController::new(
            config,
            registry.clone(),
            bus.clone(),
        ));
        (controller, registry, bus)
    }

    fn register(registry: &Registry, provider: MockProvider, priority: u32) -> Arc<Connection> {
        let method = provider.name().to_string();
        let provider: Arc<dyn TunnelProvider> = Arc::new(provider);
        let conn = Arc::new(Connection::new(
            ConnectionId::derive(&method),
            method,
            Endpoint::default(),
            None,
            priority,
            provider,
            ConnectConfig::default(),
            10,
        ));
        registry.insert(conn.clone()).unwrap();
        conn
    }

    fn fast_config() -> FailoverConfig {
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

    #[tokio::test]
    async fn single_failure_threshold_fails_over_on_first_bad_probe() {
        let (controller, registry, bus) = controller_with(FailoverConfig {
            failure_threshold: 1,
            ..fast_config()
        });

        let bad = register(&registry, MockProvider::new("bad").unhealthy_for(100), 0);
        let good = register(&registry, MockProvider::new("good"), 1);
        registry.promote_if_none(&bus, &bad);
        controller.track(bad.id());
        controller.track(good.id());

        controller.sweep().await;

        assert_eq!(bad.state(), ConnectionState::Failed);
        assert!(!bad.is_primary());
        assert!(good.is_primary());
        assert_eq!(controller.total_failovers(), 1);
    }

    #[tokio::test]
    async fn hysteresis_needs_the_full_streak() {
        let (controller, registry, _bus) = controller_with(fast_config());

        // Alternates fail/ok, so a threshold of 2 is never reached.
        let flappy = register(
            &registry,
            MockProvider::new("flappy")
                .unhealthy_for(1)
                .healthy_for(1)
                .unhealthy_for(1)
                .healthy_for(1),
            0,
        );
        controller.track(flappy.id());

        for _ in 0..4 {
            controller.sweep().await;
        }

        assert_eq!(flappy.state(), ConnectionState::Connected);
        assert!(controller.health_of(flappy.id()).unwrap().healthy);
        assert_eq!(controller.total_failovers(), 0);
    }

    #[tokio::test]
    async fn disabled_controller_tracks_health_but_takes_no_action() {
        let (controller, registry, bus) = controller_with(fast_config());
        controller.set_enabled(false);

        let bad = register(&registry, MockProvider::new("bad").unhealthy_for(100), 0);
        let good = register(&registry, MockProvider::new("good"), 1);
        registry.promote_if_none(&bus, &bad);
        controller.track(bad.id());
        controller.track(good.id());

        for _ in 0..3 {
            controller.sweep().await;
        }

        // Health bookkeeping noticed, but the connection was not failed and
        // the primary did not move.
        assert!(!controller.health_of(bad.id()).unwrap().healthy);
        assert_eq!(bad.state(), ConnectionState::Connected);
        assert!(bad.is_primary());
    }

    #[tokio::test]
    async fn latency_over_budget_fails_the_probe() {
        let (controller, registry, _bus) = controller_with(FailoverConfig {
            max_latency_ms: 10,
            failure_threshold: 1,
            ..fast_config()
        });

        let slow = register(
            &registry,
            MockProvider::new("slow").with_latency(std::time::Duration::from_millis(80)),
            0,
        );
        controller.track(slow.id());

        // The probe records the 80ms sample before the budget check reads it.
        controller.sweep().await;

        assert_eq!(slow.state(), ConnectionState::Failed);
    }
}
