//! Connection lifecycle events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::id::ConnectionId;

/// The closed set of event types emitted on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Disconnected,
    Reconnecting,
    Failover,
    MetricsUpdate,
    Error,
    StateChange,
    PrimaryChange,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Reconnecting => "reconnecting",
            EventKind::Failover => "failover",
            EventKind::MetricsUpdate => "metrics_update",
            EventKind::Error => "error",
            EventKind::StateChange => "state_change",
            EventKind::PrimaryChange => "primary_change",
        };
        f.write_str(s)
    }
}

/// Immutable record describing one state change.
///
/// Consumers must tolerate unknown keys in `data`; new fields are added
/// there rather than to the struct.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub conn_id: Option<ConnectionId>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub data: Map<String, Value>,
}

impl ConnectionEvent {
    /// Build an event not tied to a specific connection.
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            conn_id: None,
            message: message.into(),
            timestamp: Utc::now(),
            data: Map::new(),
        }
    }

    /// Build an event about one connection.
    pub fn for_connection(
        kind: EventKind,
        conn_id: ConnectionId,
        message: impl Into<String>,
    ) -> Self {
        Self {
            conn_id: Some(conn_id),
            ..Self::new(kind, message)
        }
    }

    /// Attach a data entry.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_field() {
        let event = ConnectionEvent::for_connection(
            EventKind::Failover,
            ConnectionId::new("ngrok-1"),
            "primary failed over",
        )
        .with_data("from", "ngrok-1")
        .with_data("to", "cloudflare-2");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "failover");
        assert_eq!(json["conn_id"], "ngrok-1");
        assert_eq!(json["data"]["to"], "cloudflare-2");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn kind_display_matches_wire_name() {
        assert_eq!(EventKind::PrimaryChange.to_string(), "primary_change");
        assert_eq!(EventKind::MetricsUpdate.to_string(), "metrics_update");
        let wire = serde_json::to_string(&EventKind::PrimaryChange).unwrap();
        assert_eq!(wire, "\"primary_change\"");
    }

    #[test]
    fn data_map_accepts_arbitrary_keys() {
        let event = ConnectionEvent::new(EventKind::Error, "probe failed")
            .with_data("reason", "timeout")
            .with_data("consecutive_failures", 3);

        assert_eq!(event.data.len(), 2);
        assert_eq!(event.data["consecutive_failures"], 3);
    }
}
