//! Mock [`TunnelProvider`] implementation for testing.
//!
//! `MockProvider` is scriptable along every axis the core exercises:
//! connect results and delay, a health-probe script, and a fixed latency
//! that is recorded into the connection's metrics on every probe (standing
//! in for an adapter that measures its own round trips). It also serves as
//! the reference model for writing real adapters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

use crate::domain::{Connection, Endpoint};
use crate::error::BoxError;
use crate::provider::{ConnectConfig, Tunnel, TunnelProvider};

/// The opaque handle a [`MockProvider`] attaches to its tunnels.
#[derive(Debug, PartialEq, Eq)]
pub struct MockHandle {
    pub session: u32,
}

/// A scriptable tunnel provider.
///
/// The health script is consumed one entry per probe; once exhausted the
/// provider reports `default_health` (healthy unless overridden) forever.
/// Chained `healthy_for`/`unhealthy_for` calls append segments in order:
///
/// ```
/// use warren::testkit::MockProvider;
///
/// // Healthy for 3 probes, down for 4, then healthy again.
/// let ngrok = MockProvider::new("ngrok").healthy_for(3).unhealthy_for(4);
/// ```
pub struct MockProvider {
    name: String,
    local_port: Option<u16>,
    probe_addr: Option<String>,
    latency: Option<Duration>,
    latency_jitter_ms: u64,
    connect_delay: Duration,
    connect_results: Mutex<VecDeque<Result<(), String>>>,
    disconnect_results: Mutex<VecDeque<Result<(), String>>>,
    health_script: Mutex<VecDeque<bool>>,
    default_health: bool,
    connect_count: AtomicU32,
    disconnect_count: AtomicU32,
    probe_count: AtomicU32,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local_port: Some(2222),
            probe_addr: None,
            latency: None,
            latency_jitter_ms: 0,
            connect_delay: Duration::ZERO,
            connect_results: Mutex::new(VecDeque::new()),
            disconnect_results: Mutex::new(VecDeque::new()),
            health_script: Mutex::new(VecDeque::new()),
            default_health: true,
            connect_count: AtomicU32::new(0),
            disconnect_count: AtomicU32::new(0),
            probe_count: AtomicU32::new(0),
        }
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    /// Advertise a latency-probe target on the resulting tunnels.
    pub fn with_probe_addr(mut self, addr: impl Into<String>) -> Self {
        self.probe_addr = Some(addr.into());
        self
    }

    /// Record this latency sample into the connection's metrics on every
    /// health probe.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Spread recorded latency by up to `jitter_ms` above the base value.
    pub fn with_latency_jitter_ms(mut self, jitter_ms: u64) -> Self {
        self.latency_jitter_ms = jitter_ms;
        self
    }

    /// Delay every `connect` call by this long.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Append `n` healthy probes to the health script.
    pub fn healthy_for(self, n: u32) -> Self {
        self.health_script
            .lock()
            .extend(std::iter::repeat(true).take(n as usize));
        self
    }

    /// Append `n` failing probes to the health script.
    pub fn unhealthy_for(self, n: u32) -> Self {
        self.health_script
            .lock()
            .extend(std::iter::repeat(false).take(n as usize));
        self
    }

    /// Health reported once the script is exhausted.
    pub fn default_health(mut self, healthy: bool) -> Self {
        self.default_health = healthy;
        self
    }

    /// Make the next `connect` call fail with this message.
    pub fn fail_connect(self, message: impl Into<String>) -> Self {
        self.connect_results.lock().push_back(Err(message.into()));
        self
    }

    /// Make the next `disconnect` call fail with this message.
    pub fn fail_disconnect(self, message: impl Into<String>) -> Self {
        self.disconnect_results.lock().push_back(Err(message.into()));
        self
    }

    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::Relaxed)
    }

    pub fn disconnect_count(&self) -> u32 {
        self.disconnect_count.load(Ordering::Relaxed)
    }

    pub fn probe_count(&self) -> u32 {
        self.probe_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TunnelProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self, config: &ConnectConfig) -> Result<Tunnel, BoxError> {
        let session = self.connect_count.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if let Some(Err(message)) = self.connect_results.lock().pop_front() {
            return Err(message.into());
        }

        let endpoint = Endpoint {
            local_port: config.local_port.or(self.local_port),
            remote_host: config
                .remote_host
                .clone()
                .or_else(|| Some(format!("{}.mock.example", self.name))),
            remote_port: config.remote_port.or(Some(22)),
            probe_addr: self.probe_addr.clone(),
        };
        Ok(Tunnel::new(endpoint).with_handle(Box::new(MockHandle { session })))
    }

    async fn disconnect(&self, conn: &Connection) -> Result<(), BoxError> {
        // Taking the handle makes repeat disconnects observable no-ops.
        let _handle = conn.take_handle();
        self.disconnect_count.fetch_add(1, Ordering::Relaxed);
        if let Some(Err(message)) = self.disconnect_results.lock().pop_front() {
            return Err(message.into());
        }
        Ok(())
    }

    async fn is_healthy(&self, conn: &Connection) -> bool {
        self.probe_count.fetch_add(1, Ordering::Relaxed);
        if let Some(base) = self.latency {
            let jitter = if self.latency_jitter_ms > 0 {
                rand::thread_rng().gen_range(0..=self.latency_jitter_ms)
            } else {
                0
            };
            conn.metrics()
                .record_latency(base + Duration::from_millis(jitter));
        }
        self.health_script
            .lock()
            .pop_front()
            .unwrap_or(self.default_health)
    }
}
