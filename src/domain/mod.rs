//! Core domain types: identifiers, connection records, metrics and events.

mod connection;
mod event;
mod id;
mod metrics;

pub use connection::{
    epoch_millis, Connection, ConnectionSnapshot, ConnectionState, Endpoint, ProviderHandle,
};
pub use event::{ConnectionEvent, EventKind};
pub use id::{ConnectionId, SubscriptionId};
pub use metrics::ConnectionMetrics;
