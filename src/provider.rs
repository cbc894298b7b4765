//! The provider capability boundary.
//!
//! Every tunnel technology (Cloudflare Tunnel, Tailscale, WireGuard, ngrok,
//! bore, reverse SSH, ...) is driven through exactly four operations. The
//! core assumes nothing else about adapters: no shared config schema, no
//! polymorphism beyond this trait.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{Connection, Endpoint, ProviderHandle};
use crate::error::BoxError;

/// Per-start options handed to a provider's `connect`.
///
/// Providers read what they understand and ignore the rest; adapter-specific
/// settings go into `options`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectConfig {
    #[serde(default)]
    pub local_port: Option<u16>,
    #[serde(default)]
    pub remote_host: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// A live tunnel endpoint as returned by a provider's `connect`.
pub struct Tunnel {
    pub endpoint: Endpoint,
    /// Opaque provider-side resource; the core stores it untouched and gives
    /// it back through [`Connection::take_handle`] at disconnect time.
    pub handle: Option<ProviderHandle>,
}

impl Tunnel {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            handle: None,
        }
    }

    pub fn with_handle(mut self, handle: ProviderHandle) -> Self {
        self.handle = Some(handle);
        self
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("endpoint", &self.endpoint)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

/// The four-operation contract every tunnel adapter implements.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Stable provider name used as the registry key (`"cloudflare"`,
    /// `"tailscale"`, ...).
    fn name(&self) -> &str;

    /// Establish a tunnel. Blocking is fine; the manager bounds the call
    /// with its provider deadline and invokes it outside any registry lock.
    async fn connect(&self, config: &ConnectConfig) -> Result<Tunnel, BoxError>;

    /// Tear down the provider-side resource. Must be idempotent; taking the
    /// handle out of the connection the first time is the usual way.
    async fn disconnect(&self, conn: &Connection) -> Result<(), BoxError>;

    /// Fast liveness check used by failover probes.
    async fn is_healthy(&self, conn: &Connection) -> bool;
}

/// Name-keyed registry of provider capabilities.
///
/// Registering a provider under an existing name replaces it.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn TunnelProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn TunnelProvider>) {
        let name = provider.name().to_string();
        let replaced = self
            .providers
            .write()
            .insert(name.clone(), provider)
            .is_some();
        info!(provider = %name, replaced, "Registered tunnel provider");
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TunnelProvider>> {
        self.providers.read().get(name).cloned()
    }

    /// Registered provider names, sorted for stable output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}
