//! Warren - multi-provider tunnel management with automatic failover.
//!
//! Warren drives several external tunnel and VPN providers (Cloudflare
//! Tunnel, Tailscale, WireGuard, ngrok, bore, reverse SSH, ...)
//! concurrently so that at least one working ingress path survives a
//! provider-level outage. One connection is always designated primary;
//! health probes with hysteresis move that designation when the primary
//! degrades, and move it back when a better-priority tunnel recovers.
//!
//! # Architecture
//!
//! ```text
//! src/
//! ├── domain/      # Connection records, events, metrics accumulators
//! ├── provider     # The four-operation adapter capability + registry
//! ├── events       # Non-blocking filtered pub/sub
//! ├── metrics      # Latency probes + JSON snapshots
//! ├── failover     # Health hysteresis + primary election
//! ├── manager      # Front door: start/stop/restart/list/set_primary
//! └── config/      # TOML-loadable settings + logging init
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use warren::{Config, ConnectConfig, ConnectionManager};
//! use warren::testkit::MockProvider;
//!
//! # async fn demo() -> warren::Result<()> {
//! let manager = ConnectionManager::new(Config::default())?;
//! manager.register_provider(Arc::new(MockProvider::new("cloudflare")));
//! manager.register_provider(Arc::new(MockProvider::new("tailscale")));
//!
//! let report = manager
//!     .start_multiple(&["cloudflare", "tailscale"], &ConnectConfig::default())
//!     .await;
//! println!("primary: {}", manager.get_primary()?.method());
//! # let _ = report;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `testkit` - Expose [`testkit::MockProvider`] and canonical test
//!   configurations to integration tests

pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod failover;
pub mod manager;
pub mod metrics;
pub mod provider;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use config::{Config, FailoverConfig, LoggingConfig, ManagerConfig, MetricsConfig};
pub use domain::{
    Connection, ConnectionEvent, ConnectionId, ConnectionSnapshot, ConnectionState, EventKind,
    SubscriptionId,
};
pub use error::{BoxError, Error, Result};
pub use events::{EventBus, EventFilter, Subscription};
pub use failover::HealthStatus;
pub use manager::{ConnectionManager, ManagerStats};
pub use metrics::{ConnectionMetricsSnapshot, MetricsSnapshot};
pub use provider::{ConnectConfig, ProviderRegistry, Tunnel, TunnelProvider};
