//! Periodic latency measurement and metrics snapshots.
//!
//! A single timer drives collection. Each sweep probes every connection
//! that advertises a probe target (TCP connect, short timeout) and records
//! the elapsed time; probe failures leave the latency history untouched.
//! Throughput counters are fed by adapters, not polled from the kernel.

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use rand::Rng;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::MetricsConfig;
use crate::domain::{Connection, ConnectionEvent, ConnectionId, ConnectionState, EventKind};
use crate::events::EventBus;
use crate::manager::registry::Registry;

/// JSON-stable snapshot of every connection's metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Unix seconds at snapshot time.
    pub timestamp: i64,
    pub total_connections: usize,
    pub connections: Vec<ConnectionMetricsSnapshot>,
}

/// One connection's row in a [`MetricsSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetricsSnapshot {
    pub id: ConnectionId,
    pub method: String,
    pub state: ConnectionState,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Mean of the retained latency samples.
    pub latency_ms: u64,
    pub uptime_seconds: u64,
    pub is_primary: bool,
    pub priority: u32,
}

pub(crate) struct MetricsCollector {
    config: MetricsConfig,
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
}

impl MetricsCollector {
    pub(crate) fn new(config: MetricsConfig, registry: Arc<Registry>, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            registry,
            bus,
        }
    }

    /// Consistent, JSON-serializable view of all current metrics.
    ///
    /// Safe to call concurrently with collection; each row is built from
    /// one connection's snapshot so readers never see torn counter pairs.
    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let connections = self.registry.connections();
        let mut rows: Vec<ConnectionMetricsSnapshot> = connections
            .iter()
            .map(|conn| {
                let snap = conn.snapshot();
                let metrics = conn.metrics();
                ConnectionMetricsSnapshot {
                    id: snap.id,
                    method: snap.method,
                    state: snap.state,
                    bytes_sent: metrics.bytes_sent(),
                    bytes_received: metrics.bytes_received(),
                    latency_ms: metrics.avg_latency_ms(),
                    uptime_seconds: conn.uptime().as_secs(),
                    is_primary: snap.is_primary,
                    priority: snap.priority,
                }
            })
            .collect();
        rows.sort_by_key(|r| r.priority);

        MetricsSnapshot {
            timestamp: chrono::Utc::now().timestamp(),
            total_connections: rows.len(),
            connections: rows,
        }
    }

    /// Run the collection loop until the shutdown signal fires.
    pub(crate) fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Stagger startup so co-located managers do not probe in lockstep.
            let jitter_cap = (self.config.interval_ms / 4).max(1);
            let jitter = rand::thread_rng().gen_range(0..jitter_cap);
            tokio::time::sleep(std::time::Duration::from_millis(jitter)).await;

            let mut interval = tokio::time::interval(self.config.interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            debug!(interval_ms = self.config.interval_ms, "Metrics collector started");

            loop {
                tokio::select! {
                    _ = interval.tick() => self.collect().await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Metrics collector stopped");
        })
    }

    /// One sweep: measure latency for every probeable connection.
    pub(crate) async fn collect(&self) {
        let connections = self.registry.connections();
        if connections.is_empty() {
            return;
        }

        let probed = join_all(connections.iter().map(|c| self.probe(c)))
            .await
            .into_iter()
            .filter(|p| *p)
            .count();

        self.bus.publish(
            ConnectionEvent::new(EventKind::MetricsUpdate, "metrics collected")
                .with_data("total_connections", connections.len())
                .with_data("probed", probed),
        );
    }

    /// Measure one connection. Returns whether a probe was attempted.
    async fn probe(&self, conn: &Arc<Connection>) -> bool {
        let Some(addr) = conn.endpoint().probe_addr.clone() else {
            // No probe target; the adapter feeds its own samples, if any.
            return false;
        };

        let started = Instant::now();
        match tokio::time::timeout(self.config.probe_timeout(), TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => {
                let elapsed = started.elapsed();
                conn.metrics().record_latency(elapsed);
                conn.touch();
                trace!(
                    connection_id = %conn.id(),
                    latency_ms = elapsed.as_millis() as u64,
                    "Latency probe"
                );
            }
            Ok(Err(e)) => {
                let failures = conn.metrics().record_probe_failure();
                debug!(
                    connection_id = %conn.id(),
                    error = %e,
                    failures,
                    "Latency probe failed"
                );
            }
            Err(_) => {
                let failures = conn.metrics().record_probe_failure();
                debug!(connection_id = %conn.id(), failures, "Latency probe timed out");
            }
        }
        true
    }
}
