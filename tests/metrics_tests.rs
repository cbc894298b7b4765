//! Metrics through the manager: snapshot shape, counter monotonicity and
//! collection events.

mod support;

use std::time::Duration;

use support::{manager_with, manager_with_config, next_event_of, wait_until, DEADLINE};
use warren::testkit::config::fast_config;
use warren::testkit::MockProvider;
use warren::{ConnectConfig, EventKind};

#[tokio::test]
async fn snapshot_carries_the_wire_fields() {
    let (manager, _) = manager_with(vec![
        MockProvider::new("cloudflare").with_latency(Duration::from_millis(40)),
    ]);
    let conn = manager
        .start("cloudflare", ConnectConfig::default())
        .await
        .unwrap();
    conn.metrics().add_bytes_sent(4096);
    conn.metrics().add_bytes_received(512);

    // Failover probes feed the latency history.
    assert!(
        wait_until(DEADLINE, || {
            manager.metrics().connections[0].latency_ms == 40
        })
        .await
    );

    let snapshot = manager.metrics();
    assert_eq!(snapshot.total_connections, 1);

    let json = serde_json::to_value(&snapshot).unwrap();
    let row = &json["connections"][0];
    assert_eq!(row["id"], conn.id().as_str());
    assert_eq!(row["method"], "cloudflare");
    assert_eq!(row["state"], "connected");
    assert_eq!(row["bytes_sent"], 4096);
    assert_eq!(row["bytes_received"], 512);
    assert_eq!(row["latency_ms"], 40);
    assert_eq!(row["is_primary"], true);
    assert_eq!(row["priority"], 0);
    assert!(row["uptime_seconds"].is_u64());
    assert!(json["timestamp"].as_i64().unwrap() > 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn byte_counters_never_regress_across_snapshots() {
    let (manager, _) = manager_with(vec![MockProvider::new("wireguard")]);
    let conn = manager
        .start("wireguard", ConnectConfig::default())
        .await
        .unwrap();

    let mut last_sent = 0;
    let mut last_received = 0;
    for i in 0..10u64 {
        if i % 3 != 0 {
            conn.metrics().add_bytes_sent(i * 17);
            conn.metrics().add_bytes_received(i * 5);
        }
        let row = &manager.metrics().connections[0];
        assert!(row.bytes_sent >= last_sent);
        assert!(row.bytes_received >= last_received);
        last_sent = row.bytes_sent;
        last_received = row.bytes_received;
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn collector_announces_sweeps() {
    let mut config = fast_config();
    config.metrics.interval_ms = 50;
    let (manager, _) = manager_with_config(config, vec![MockProvider::new("tailscale")]);
    let mut updates = manager
        .subscribe(
            "metrics",
            Some(Box::new(|e| e.kind == EventKind::MetricsUpdate)),
        )
        .unwrap();

    manager.start("tailscale", ConnectConfig::default()).await.unwrap();

    let update = next_event_of(&mut updates, EventKind::MetricsUpdate, DEADLINE)
        .await
        .expect("metrics update event");
    assert_eq!(update.data["total_connections"], 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn snapshot_rows_follow_priority_order() {
    let (manager, _) = manager_with(vec![
        MockProvider::new("a"),
        MockProvider::new("b"),
        MockProvider::new("c"),
    ]);
    manager
        .start_multiple(&["c", "a", "b"], &ConnectConfig::default())
        .await
        .unwrap();

    let methods: Vec<String> = manager
        .metrics()
        .connections
        .iter()
        .map(|r| r.method.clone())
        .collect();
    assert_eq!(methods, ["c", "a", "b"]);
    manager.shutdown().await;
}
