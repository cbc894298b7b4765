//! The connection manager front door.
//!
//! Owns the set of live connections and the background services (failover
//! controller, metrics collector, event bus). All additions and removals go
//! through this type; collaborators look connections up by id and never
//! remove them.
//!
//! Provider calls can block for their full deadline, so they are made
//! outside the registry lock; the lock only covers table mutation.

pub(crate) mod registry;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::{
    Connection, ConnectionEvent, ConnectionId, ConnectionSnapshot, ConnectionState, EventKind,
};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventFilter, Subscription};
use crate::failover::{FailoverController, HealthStatus};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::provider::{ConnectConfig, ProviderRegistry, TunnelProvider};
use self::registry::Registry;

/// Counters for observability.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub active_connections: usize,
    pub total_started: u64,
    pub total_failovers: u64,
    pub events_dropped: u64,
}

/// Drives multiple tunnel providers concurrently with automatic failover.
///
/// Construct with [`ConnectionManager::new`] inside a tokio runtime (the
/// background services are spawned immediately), register providers, then
/// start connections by method name.
pub struct ConnectionManager {
    config: Config,
    providers: ProviderRegistry,
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    failover: Arc<FailoverController>,
    collector: Arc<MetricsCollector>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    next_priority: AtomicU32,
    total_started: AtomicU64,
}

impl ConnectionManager {
    /// Build a manager and spawn its background services.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when the configuration has
    /// out-of-range values.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::new(config.manager.event_buffer));
        let registry = Arc::new(Registry::new());
        let failover = Arc::new(FailoverController::new(
            config.failover.clone(),
            registry.clone(),
            bus.clone(),
        ));
        let collector = Arc::new(MetricsCollector::new(
            config.metrics.clone(),
            registry.clone(),
            bus.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            failover.clone().spawn(shutdown_rx.clone()),
            collector.clone().spawn(shutdown_rx),
        ];

        Ok(Self {
            config,
            providers: ProviderRegistry::new(),
            registry,
            bus,
            failover,
            collector,
            tasks: Mutex::new(tasks),
            shutdown_tx,
            closed: AtomicBool::new(false),
            next_priority: AtomicU32::new(0),
            total_started: AtomicU64::new(0),
        })
    }

    /// Add (or replace) a provider capability.
    pub fn register_provider(&self, provider: Arc<dyn TunnelProvider>) {
        self.providers.register(provider);
    }

    /// Registered provider names.
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.names()
    }

    /// Start one connection through the named provider.
    ///
    /// On success the connection is Connected, registered with failover and
    /// metrics, a `Connected` event is out, and it holds the primary slot if
    /// none was taken.
    ///
    /// # Errors
    ///
    /// `ProviderNotFound`, `AlreadyStarted` (one live connection per
    /// method), `Timeout`, or the provider's own failure wrapped in
    /// `Provider`.
    pub async fn start(&self, method: &str, config: ConnectConfig) -> Result<Arc<Connection>> {
        self.ensure_open()?;
        let priority = self.next_priority.fetch_add(1, Ordering::Relaxed);
        self.start_inner(method, config, priority, true).await
    }

    /// Start several providers in parallel.
    ///
    /// Successes keep their input-order priorities, so `list()` afterwards
    /// yields them in input order with failures absent. The first success in
    /// input order becomes primary when none exists. Partial success is a
    /// success: started connections stay up and the per-method failures come
    /// back in [`Error::Partial`].
    pub async fn start_multiple(
        &self,
        methods: &[&str],
        config: &ConnectConfig,
    ) -> Result<Vec<Arc<Connection>>> {
        self.ensure_open()?;
        if methods.is_empty() {
            return Ok(Vec::new());
        }

        let base = self
            .next_priority
            .fetch_add(methods.len() as u32, Ordering::Relaxed);
        let attempts = join_all(methods.iter().enumerate().map(|(i, method)| {
            let config = config.clone();
            async move {
                self.start_inner(method, config, base + i as u32, false)
                    .await
            }
        }))
        .await;

        let mut started = Vec::new();
        let mut failures = Vec::new();
        for (method, attempt) in methods.iter().zip(attempts) {
            match attempt {
                Ok(conn) => started.push(conn),
                Err(e) => failures.push((method.to_string(), e)),
            }
        }

        if let Some(first) = started.first() {
            self.registry.promote_if_none(&self.bus, first);
        }

        if failures.is_empty() {
            Ok(started)
        } else {
            Err(Error::Partial {
                attempted: methods.len(),
                failures,
            })
        }
    }

    async fn start_inner(
        &self,
        method: &str,
        config: ConnectConfig,
        priority: u32,
        promote: bool,
    ) -> Result<Arc<Connection>> {
        let provider = self
            .providers
            .get(method)
            .ok_or_else(|| Error::ProviderNotFound {
                method: method.to_string(),
            })?;
        if let Some(id) = self.registry.contains_method(method) {
            return Err(Error::AlreadyStarted {
                method: method.to_string(),
                id,
            });
        }

        let timeout = self.config.manager.provider_timeout();
        let tunnel = tokio::time::timeout(timeout, provider.connect(&config))
            .await
            .map_err(|_| Error::Timeout {
                operation: "connect",
                timeout,
            })?
            .map_err(|source| Error::Provider {
                method: method.to_string(),
                source,
            })?;

        let conn = Arc::new(Connection::new(
            ConnectionId::derive(method),
            method,
            tunnel.endpoint,
            tunnel.handle,
            priority,
            provider.clone(),
            config,
            self.config.metrics.history_size,
        ));

        if let Err(e) = self.registry.insert(conn.clone()) {
            // Lost a registration race; tear down the tunnel we just opened.
            let orphan = conn.clone();
            tokio::spawn(async move {
                let _ = orphan.provider().disconnect(&orphan).await;
            });
            return Err(e);
        }
        self.failover.track(conn.id());
        self.total_started.fetch_add(1, Ordering::Relaxed);

        info!(
            connection_id = %conn.id(),
            method,
            priority,
            local_port = conn.endpoint().local_port,
            "Connection started"
        );
        self.bus.publish(
            ConnectionEvent::for_connection(
                EventKind::Connected,
                conn.id().clone(),
                format!("{method} tunnel connected"),
            )
            .with_data("method", method),
        );

        if promote {
            self.registry.promote_if_none(&self.bus, &conn);
        }
        Ok(conn)
    }

    /// Stop and deregister a connection.
    ///
    /// The connection leaves the registry before the `Disconnected` event is
    /// published; provider disconnect failures are reported as `Error`
    /// events but never leak a registry entry. A replacement primary is
    /// elected (best-effort) before this returns.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id is unknown (so a second stop of the same id
    /// fails with `NotFound` and emits nothing).
    pub async fn stop(&self, id: &ConnectionId) -> Result<()> {
        self.ensure_open()?;
        self.stop_internal(id, self.config.manager.provider_timeout())
            .await
    }

    async fn stop_internal(&self, id: &ConnectionId, timeout: Duration) -> Result<()> {
        let conn = self
            .registry
            .remove(id)
            .ok_or_else(|| Error::NotFound { id: id.clone() })?;
        let was_primary = conn.is_primary();

        self.teardown(&conn, timeout).await;

        if was_primary {
            self.registry.elect_primary(&self.bus);
        }
        Ok(())
    }

    async fn teardown(&self, conn: &Arc<Connection>, timeout: Duration) {
        self.failover.untrack(conn.id());
        conn.set_primary_flag(false);
        conn.set_state(ConnectionState::Disconnected);

        match tokio::time::timeout(timeout, conn.provider().disconnect(conn)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(connection_id = %conn.id(), error = %e, "Provider disconnect failed");
                self.bus.publish(
                    ConnectionEvent::for_connection(
                        EventKind::Error,
                        conn.id().clone(),
                        format!("disconnect failed: {e}"),
                    )
                    .with_data("method", conn.method()),
                );
            }
            Err(_) => {
                warn!(connection_id = %conn.id(), "Provider disconnect timed out");
                self.bus.publish(ConnectionEvent::for_connection(
                    EventKind::Error,
                    conn.id().clone(),
                    "disconnect timed out",
                ));
            }
        }

        info!(connection_id = %conn.id(), method = conn.method(), "Connection stopped");
        self.bus.publish(ConnectionEvent::for_connection(
            EventKind::Disconnected,
            conn.id().clone(),
            format!("{} tunnel disconnected", conn.method()),
        ));
    }

    /// Stop and start the same method again. The new connection gets a
    /// fresh id and a fresh priority slot; callers that pinned the old
    /// instance as primary should call [`set_primary`](Self::set_primary)
    /// on the new id.
    pub async fn restart(&self, id: &ConnectionId) -> Result<Arc<Connection>> {
        self.ensure_open()?;
        let conn = self
            .registry
            .get(id)
            .ok_or_else(|| Error::NotFound { id: id.clone() })?;
        let method = conn.method().to_string();
        let config = conn.config().clone();

        conn.set_state(ConnectionState::Reconnecting);
        self.bus.publish(ConnectionEvent::for_connection(
            EventKind::Reconnecting,
            conn.id().clone(),
            format!("restarting {method} tunnel"),
        ));

        self.stop_internal(id, self.config.manager.provider_timeout())
            .await?;
        self.start(&method, config).await
    }

    /// Best-effort parallel teardown of every connection.
    ///
    /// # Errors
    ///
    /// `Partial` aggregating any disconnect failures. Connections that were
    /// already gone when their stop ran do not count as failures, which
    /// makes this idempotent.
    pub async fn stop_all(&self) -> Result<()> {
        self.ensure_open()?;
        self.stop_all_internal(self.config.manager.provider_timeout())
            .await
    }

    async fn stop_all_internal(&self, timeout: Duration) -> Result<()> {
        let ids = self.registry.ids();
        let attempted = ids.len();
        let results = join_all(ids.into_iter().map(|id| async move {
            let result = self.stop_internal(&id, timeout).await;
            (id, result)
        }))
        .await;

        let failures: Vec<(String, Error)> = results
            .into_iter()
            .filter_map(|(id, result)| match result {
                Ok(()) => None,
                Err(Error::NotFound { .. }) => None,
                Err(e) => Some((id.to_string(), e)),
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Partial {
                attempted,
                failures,
            })
        }
    }

    /// Snapshot of one connection.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id is unknown.
    pub fn status(&self, id: &ConnectionId) -> Result<ConnectionSnapshot> {
        self.registry
            .get(id)
            .map(|c| c.snapshot())
            .ok_or_else(|| Error::NotFound { id: id.clone() })
    }

    /// Snapshots of every connection, priority ascending.
    pub fn list(&self) -> Vec<ConnectionSnapshot> {
        self.registry.sorted_snapshots()
    }

    /// Manually pin the primary slot to a connection.
    ///
    /// The override persists until that connection leaves Connected; auto
    /// recovery will not steal the slot back in the meantime. Priorities are
    /// not changed.
    ///
    /// # Errors
    ///
    /// `NotFound`, or `NotHealthy` when the target is not Connected.
    pub fn set_primary(&self, id: &ConnectionId) -> Result<()> {
        self.ensure_open()?;
        self.registry.set_manual_primary(&self.bus, id)
    }

    /// The current primary connection.
    ///
    /// # Errors
    ///
    /// `NoPrimary` when none is elected.
    pub fn get_primary(&self) -> Result<Arc<Connection>> {
        self.registry.current_primary().ok_or(Error::NoPrimary)
    }

    /// Toggle automatic failover at runtime.
    pub fn enable_auto_failover(&self, enabled: bool) {
        self.failover.set_enabled(enabled);
    }

    pub fn auto_failover_enabled(&self) -> bool {
        self.failover.is_enabled()
    }

    /// Failover health bookkeeping for a connection, if tracked.
    pub fn health(&self, id: &ConnectionId) -> Option<HealthStatus> {
        self.failover.health_of(id)
    }

    /// Subscribe to connection events, optionally filtered.
    ///
    /// # Errors
    ///
    /// `Closed` after shutdown.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        filter: Option<EventFilter>,
    ) -> Result<Subscription> {
        self.bus.subscribe(name, filter)
    }

    /// Remove a subscription and close its channel.
    pub fn unsubscribe(&self, id: &crate::domain::SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Current metrics for every connection.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.collector.snapshot()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            active_connections: self.registry.len(),
            total_started: self.total_started.load(Ordering::Relaxed),
            total_failovers: self.failover.total_failovers(),
            events_dropped: self.bus.events_dropped(),
        }
    }

    /// Stop the background services, disconnect everything, close the bus.
    ///
    /// Idempotent. In-flight probes get `shutdown_grace` to finish before
    /// their tasks are aborted; provider disconnects get the same grace.
    /// After this returns, mutating operations fail with `Closed` and reads
    /// see an empty manager.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Connection manager shutting down");
        let _ = self.shutdown_tx.send(true);

        let grace = self.config.manager.shutdown_grace();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(grace, handle).await.is_err() {
                abort.abort();
            }
        }

        if let Err(e) = self.stop_all_internal(grace).await {
            warn!(error = %e, "Best-effort teardown reported failures");
        }
        self.bus.shutdown();
        info!("Connection manager shut down");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
