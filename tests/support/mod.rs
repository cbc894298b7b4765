//! Shared harness for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use warren::testkit::config::fast_config;
use warren::testkit::MockProvider;
use warren::{
    Config, ConnectionEvent, ConnectionManager, EventKind, Subscription,
};

/// How long scenario assertions may wait for background sweeps.
pub const DEADLINE: Duration = Duration::from_secs(3);

/// Build a manager with the canonical fast test config and the given
/// providers registered. The provider handles are returned for call-count
/// assertions.
pub fn manager_with(providers: Vec<MockProvider>) -> (ConnectionManager, Vec<Arc<MockProvider>>) {
    manager_with_config(fast_config(), providers)
}

pub fn manager_with_config(
    config: Config,
    providers: Vec<MockProvider>,
) -> (ConnectionManager, Vec<Arc<MockProvider>>) {
    let manager = ConnectionManager::new(config).expect("test config is valid");
    let handles: Vec<Arc<MockProvider>> = providers.into_iter().map(Arc::new).collect();
    for provider in &handles {
        manager.register_provider(provider.clone());
    }
    (manager, handles)
}

/// Poll `check` every 10ms until it holds or `deadline` passes.
pub async fn wait_until(deadline: Duration, check: impl Fn() -> bool) -> bool {
    let started = tokio::time::Instant::now();
    while started.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Receive events until one of `kind` arrives; `None` on deadline or a
/// closed channel.
pub async fn next_event_of(
    sub: &mut Subscription,
    kind: EventKind,
    deadline: Duration,
) -> Option<ConnectionEvent> {
    tokio::time::timeout(deadline, async {
        while let Some(event) = sub.recv().await {
            if event.kind == kind {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Drain everything currently buffered on a subscription.
pub fn drain(sub: &mut Subscription) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    while let Some(event) = sub.try_recv() {
        events.push(event);
    }
    events
}
