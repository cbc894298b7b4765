//! The manager's connection table and primary election.
//!
//! Additions and removals go through the manager front door; the failover
//! controller and metrics collector only read. Elections are serialized by a single mutex so
//! observers see a consistent sequence of primary handoffs, and all primary
//! flag changes happen under that mutex.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};

use crate::domain::{
    Connection, ConnectionEvent, ConnectionId, ConnectionSnapshot, ConnectionState, EventKind,
};
use crate::error::{Error, Result};
use crate::events::EventBus;

#[derive(Default)]
pub(crate) struct Registry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    /// Serializes every primary-flag mutation.
    election: Mutex<()>,
    /// Set by a manual `set_primary`; cleared when the chosen connection
    /// leaves Connected and an election runs.
    manual_primary: Mutex<Option<ConnectionId>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a connection. One live connection per provider method.
    pub(crate) fn insert(&self, conn: Arc<Connection>) -> Result<()> {
        let mut connections = self.connections.write();
        if let Some(existing) = connections.values().find(|c| c.method() == conn.method()) {
            return Err(Error::AlreadyStarted {
                method: conn.method().to_string(),
                id: existing.id().clone(),
            });
        }
        connections.insert(conn.id().clone(), conn);
        Ok(())
    }

    pub(crate) fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(id);
        if removed.is_some() {
            let mut manual = self.manual_primary.lock();
            if manual.as_ref() == Some(id) {
                *manual = None;
            }
        }
        removed
    }

    pub(crate) fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(id).cloned()
    }

    pub(crate) fn contains_method(&self, method: &str) -> Option<ConnectionId> {
        self.connections
            .read()
            .values()
            .find(|c| c.method() == method)
            .map(|c| c.id().clone())
    }

    pub(crate) fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    pub(crate) fn ids(&self) -> Vec<ConnectionId> {
        self.connections.read().keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Snapshots ordered by priority ascending.
    pub(crate) fn sorted_snapshots(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshots: Vec<ConnectionSnapshot> = self
            .connections
            .read()
            .values()
            .map(|c| c.snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.priority);
        snapshots
    }

    pub(crate) fn current_primary(&self) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .values()
            .find(|c| c.is_primary())
            .cloned()
    }

    /// Pick a new primary from the Connected connections.
    ///
    /// Candidates are ordered by priority ascending, ties broken towards the
    /// more recently active connection. Clears any manual override (an
    /// election only runs once the overridden primary has left Connected).
    /// Emits `PrimaryChange` when the primary actually changes, including
    /// the change to "none" when no candidate is available.
    pub(crate) fn elect_primary(&self, bus: &EventBus) -> Option<Arc<Connection>> {
        let _guard = self.election.lock();
        *self.manual_primary.lock() = None;

        let mut candidates: Vec<Arc<Connection>> = self
            .connections
            .read()
            .values()
            .filter(|c| c.state() == ConnectionState::Connected)
            .cloned()
            .collect();
        candidates.sort_by_key(|c| (c.priority(), Reverse(c.last_active_millis())));

        let old = self.current_primary();
        let new = candidates.into_iter().next();

        let unchanged = match (&old, &new) {
            (Some(o), Some(n)) => o.id() == n.id(),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return new;
        }

        if let Some(o) = &old {
            o.set_primary_flag(false);
        }
        if let Some(n) = &new {
            n.set_primary_flag(true);
            info!(
                from = old.as_ref().map(|c| c.id().as_str()).unwrap_or("none"),
                to = %n.id(),
                method = n.method(),
                "Elected new primary"
            );
        } else {
            info!(
                from = %old.as_ref().map(|c| c.id().to_string()).unwrap_or_default(),
                "No healthy candidate, primary cleared"
            );
        }

        bus.publish(primary_change_event(old.as_deref(), new.as_deref()));
        new
    }

    /// Make `conn` primary only when no primary exists yet.
    pub(crate) fn promote_if_none(&self, bus: &EventBus, conn: &Arc<Connection>) -> bool {
        let _guard = self.election.lock();
        if self.current_primary().is_some() {
            return false;
        }
        if conn.state() != ConnectionState::Connected || self.get(conn.id()).is_none() {
            return false;
        }

        conn.set_primary_flag(true);
        debug!(connection_id = %conn.id(), method = conn.method(), "Promoted initial primary");
        bus.publish(primary_change_event(None, Some(conn)));
        true
    }

    /// Manual primary override.
    ///
    /// The override persists until the chosen connection leaves Connected;
    /// until then automatic recovery promotion leaves it alone.
    pub(crate) fn set_manual_primary(&self, bus: &EventBus, id: &ConnectionId) -> Result<()> {
        let _guard = self.election.lock();
        let conn = self.get(id).ok_or_else(|| Error::NotFound { id: id.clone() })?;

        let state = conn.state();
        if state != ConnectionState::Connected {
            return Err(Error::NotHealthy {
                id: id.clone(),
                state,
            });
        }

        let old = self.current_primary();
        *self.manual_primary.lock() = Some(id.clone());
        if let Some(o) = &old {
            if o.id() == id {
                return Ok(());
            }
            o.set_primary_flag(false);
        }
        conn.set_primary_flag(true);
        info!(
            from = old.as_ref().map(|c| c.id().as_str()).unwrap_or("none"),
            to = %id,
            "Manual primary override"
        );
        bus.publish(primary_change_event(old.as_deref(), Some(&conn)));
        Ok(())
    }

    /// Hand the primary slot to a recovered, better-priority connection.
    ///
    /// No-op when a manual override is active or when the current primary
    /// already has an equal or better priority.
    pub(crate) fn reclaim_primary(&self, bus: &EventBus, conn: &Arc<Connection>) -> bool {
        let _guard = self.election.lock();
        if self.manual_primary.lock().is_some() {
            return false;
        }
        if conn.state() != ConnectionState::Connected || self.get(conn.id()).is_none() {
            return false;
        }

        let old = self.current_primary();
        if let Some(o) = &old {
            if o.id() == conn.id() || o.priority() <= conn.priority() {
                return false;
            }
            o.set_primary_flag(false);
        }
        conn.set_primary_flag(true);
        info!(
            from = old.as_ref().map(|c| c.id().as_str()).unwrap_or("none"),
            to = %conn.id(),
            method = conn.method(),
            "Recovered connection reclaimed primary"
        );
        bus.publish(primary_change_event(old.as_deref(), Some(conn)));
        true
    }
}

fn primary_change_event(old: Option<&Connection>, new: Option<&Connection>) -> ConnectionEvent {
    let message = match (old, new) {
        (Some(o), Some(n)) => format!("primary changed from {} to {}", o.id(), n.id()),
        (None, Some(n)) => format!("primary set to {}", n.id()),
        (Some(o), None) => format!("primary {} cleared", o.id()),
        (None, None) => "primary unchanged".to_string(),
    };
    let mut event = ConnectionEvent::new(EventKind::PrimaryChange, message);
    event.conn_id = new.map(|n| n.id().clone());
    event
        .with_data(
            "from",
            old.map(|c| Value::from(c.id().as_str())).unwrap_or(Value::Null),
        )
        .with_data(
            "to",
            new.map(|c| Value::from(c.id().as_str())).unwrap_or(Value::Null),
        )
}
