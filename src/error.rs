//! Crate-wide error type and result alias.

use std::time::Duration;

use thiserror::Error;

use crate::domain::{ConnectionId, ConnectionState};

/// Boxed error type used at the provider capability boundary.
///
/// Adapters wrap whatever their underlying tooling produces (process spawn
/// failures, CLI parse errors, socket errors) in this; the core re-wraps it
/// in [`Error::Provider`] with the provider method name attached.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no provider registered under {method:?}")]
    ProviderNotFound { method: String },

    #[error("a {method} connection is already running ({id})")]
    AlreadyStarted { method: String, id: ConnectionId },

    #[error("no connection with id {id}")]
    NotFound { id: ConnectionId },

    #[error("connection {id} is {state}, not connected")]
    NotHealthy {
        id: ConnectionId,
        state: ConnectionState,
    },

    #[error("no primary connection elected")]
    NoPrimary,

    #[error("provider {method} failed: {source}")]
    Provider {
        method: String,
        #[source]
        source: BoxError,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("connection manager is shut down")]
    Closed,

    /// Aggregated per-entry failures from a fan-out operation.
    ///
    /// Entries that succeeded stay in effect; this is not a rollback.
    #[error("{}/{attempted} operations failed: {}", failures.len(), summarize(failures))]
    Partial {
        attempted: usize,
        failures: Vec<(String, Error)>,
    },

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn summarize(failures: &[(String, Error)]) -> String {
    failures
        .iter()
        .map(|(name, e)| format!("{name}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Look up the failure recorded for a given fan-out entry, if any.
    pub fn failure_for(&self, name: &str) -> Option<&Error> {
        match self {
            Error::Partial { failures, .. } => failures
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, e)| e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_error_summarizes_failures() {
        let err = Error::Partial {
            attempted: 3,
            failures: vec![
                (
                    "ngrok".to_string(),
                    Error::ProviderNotFound {
                        method: "ngrok".to_string(),
                    },
                ),
                ("bore".to_string(), Error::Closed),
            ],
        };

        let msg = err.to_string();
        assert!(msg.contains("2/3"));
        assert!(msg.contains("ngrok"));
        assert!(msg.contains("bore"));
    }

    #[test]
    fn failure_for_finds_entry() {
        let err = Error::Partial {
            attempted: 2,
            failures: vec![("bad".to_string(), Error::NoPrimary)],
        };

        assert!(matches!(err.failure_for("bad"), Some(Error::NoPrimary)));
        assert!(err.failure_for("good").is_none());
        assert!(Error::Closed.failure_for("bad").is_none());
    }
}
