//! Live connection records.
//!
//! A [`Connection`] is one live tunnel instance owned by the manager.
//! Mutable state (the lifecycle state and its transition timestamp) sits
//! behind a per-connection read-write lock so concurrent readers always
//! observe a consistent snapshot; cross-task activity stamps use atomic
//! epoch-millis cells.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::domain::id::ConnectionId;
use crate::domain::metrics::ConnectionMetrics;
use crate::provider::{ConnectConfig, TunnelProvider};

/// Opaque handle to the provider-side resource backing a connection.
///
/// Only the provider that created it knows what is inside (a child process,
/// a socket, a session token). The core never inspects it.
pub type ProviderHandle = Box<dyn Any + Send + Sync>;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where a tunnel is reachable.
///
/// All fields are informational; some providers (mesh VPNs in particular)
/// do not use all of them. `probe_addr` is the provider-chosen target for
/// latency probes; connections without one are skipped by the collector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub local_port: Option<u16>,
    #[serde(default)]
    pub remote_host: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub probe_addr: Option<String>,
}

struct StateCell {
    state: ConnectionState,
    changed_at: DateTime<Utc>,
}

/// One live tunnel instance.
pub struct Connection {
    id: ConnectionId,
    method: String,
    endpoint: Endpoint,
    priority: u32,
    primary: AtomicBool,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    last_active_ms: AtomicU64,
    state: RwLock<StateCell>,
    metrics: Arc<ConnectionMetrics>,
    provider: Arc<dyn TunnelProvider>,
    config: ConnectConfig,
    handle: Mutex<Option<ProviderHandle>>,
}

impl Connection {
    /// Build a freshly connected record from a provider's tunnel.
    pub(crate) fn new(
        id: ConnectionId,
        method: impl Into<String>,
        endpoint: Endpoint,
        handle: Option<ProviderHandle>,
        priority: u32,
        provider: Arc<dyn TunnelProvider>,
        config: ConnectConfig,
        history_size: usize,
    ) -> Self {
        Self {
            id,
            method: method.into(),
            endpoint,
            priority,
            primary: AtomicBool::new(false),
            started_at: Utc::now(),
            started_instant: Instant::now(),
            last_active_ms: AtomicU64::new(epoch_millis()),
            state: RwLock::new(StateCell {
                state: ConnectionState::Connected,
                changed_at: Utc::now(),
            }),
            metrics: Arc::new(ConnectionMetrics::new(history_size)),
            provider,
            config,
            handle: Mutex::new(handle),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn metrics(&self) -> &Arc<ConnectionMetrics> {
        &self.metrics
    }

    pub(crate) fn provider(&self) -> &Arc<dyn TunnelProvider> {
        &self.provider
    }

    pub(crate) fn config(&self) -> &ConnectConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.read().state
    }

    /// Timestamp of the last state transition.
    pub fn state_changed_at(&self) -> DateTime<Utc> {
        self.state.read().changed_at
    }

    /// Transition to a new state, stamping the change time.
    ///
    /// Returns the previous state. Setting the current state again is a
    /// no-op and does not refresh the timestamp.
    pub(crate) fn set_state(&self, new: ConnectionState) -> ConnectionState {
        let mut cell = self.state.write();
        let old = cell.state;
        if old != new {
            cell.state = new;
            cell.changed_at = Utc::now();
        }
        old
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Acquire)
    }

    pub(crate) fn set_primary_flag(&self, primary: bool) {
        self.primary.store(primary, Ordering::Release);
    }

    /// Record activity on this connection (successful probe, traffic seen).
    pub fn touch(&self) {
        self.last_active_ms.store(epoch_millis(), Ordering::Relaxed);
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        let ms = self.last_active_ms.load(Ordering::Relaxed);
        DateTime::<Utc>::from_timestamp_millis(ms as i64).unwrap_or_default()
    }

    pub(crate) fn last_active_millis(&self) -> u64 {
        self.last_active_ms.load(Ordering::Relaxed)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Monotonic time since this connection was started.
    pub fn uptime(&self) -> Duration {
        self.started_instant.elapsed()
    }

    /// Take the opaque provider handle, leaving `None` behind.
    ///
    /// Called by the provider's `disconnect`; a second call observes `None`,
    /// which is what makes disconnect idempotent.
    pub fn take_handle(&self) -> Option<ProviderHandle> {
        self.handle.lock().take()
    }

    /// Consistent point-in-time view of this connection.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let cell = self.state.read();
        ConnectionSnapshot {
            id: self.id.clone(),
            method: self.method.clone(),
            state: cell.state,
            local_port: self.endpoint.local_port,
            remote_host: self.endpoint.remote_host.clone(),
            remote_port: self.endpoint.remote_port,
            priority: self.priority,
            is_primary: self.is_primary(),
            started_at: self.started_at,
            last_active: self.last_active(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("state", &self.state())
            .field("priority", &self.priority)
            .field("primary", &self.is_primary())
            .finish_non_exhaustive()
    }
}

/// Read-only view of a connection, safe to hold across await points.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub method: String,
    pub state: ConnectionState,
    pub local_port: Option<u16>,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub priority: u32,
    pub is_primary: bool,
    pub started_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// Return the current time as epoch milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
