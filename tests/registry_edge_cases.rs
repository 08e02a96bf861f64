//! Registry edge cases & error handling tests
//!
//! Covers lookup misses, health-state handling, non-blocking budgets and the
//! dump format.

use connpool::{ConnOp, ConnPoolError, ConnState, ConnTable, ConnectionNode, WaitBudget};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn node(ip: &str, port: u16) -> Arc<ConnectionNode> {
    Arc::new(ConnectionNode::new(ip, port).unwrap())
}

#[tokio::test]
async fn lookup_on_empty_table_reports_not_found() {
    let table = ConnTable::new();
    let err = table
        .timed_get("10.0.0.1", 80, WaitBudget::Immediate)
        .await
        .unwrap_err();
    assert_eq!(err, ConnPoolError::NotFound);
}

#[tokio::test]
async fn lookup_with_invalid_ip_reports_invalid_endpoint() {
    let table = ConnTable::new();
    let err = table
        .timed_get("cache01.internal", 80, WaitBudget::Immediate)
        .await
        .unwrap_err();
    assert!(matches!(err, ConnPoolError::InvalidEndpoint(_)));
}

#[tokio::test]
async fn single_acquire_release_round_trip() {
    let table = ConnTable::new();
    let n = node("10.0.0.1", 80);
    table.insert(&n).unwrap();
    assert_eq!(n.state(), ConnState::Ready);

    let got = table
        .timed_get("10.0.0.1", 80, WaitBudget::Immediate)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&got, &n));
    assert_eq!(got.state(), ConnState::Active);
    assert!(got.is_locked());
    assert_eq!(got.pool().unwrap().idle_connections(), 0);

    table.put(&got, ConnOp::Get);
    assert_eq!(n.state(), ConnState::Ready);
    assert!(!n.is_locked());
    assert_eq!(n.nr_lookups(), 1);
    assert_eq!(n.pool().unwrap().idle_connections(), 1);

    table.remove(&n).unwrap();
    assert_eq!(n.state(), ConnState::Zombie);
}

#[tokio::test]
async fn acquire_prefers_the_newest_insertion() {
    let table = ConnTable::new();
    let a = node("10.0.0.1", 80);
    let b = node("10.0.0.1", 80);
    let c = node("10.0.0.1", 80);
    for n in [&a, &b, &c] {
        table.insert(n).unwrap();
    }

    let first = table
        .timed_get("10.0.0.1", 80, WaitBudget::Immediate)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &c), "head insertion, head-first scan");

    let second = table
        .timed_get("10.0.0.1", 80, WaitBudget::Immediate)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&second, &b));
}

#[tokio::test]
async fn zero_budget_never_blocks_on_a_busy_pool() {
    let table = ConnTable::new();
    let n = node("10.0.0.1", 80);
    table.insert(&n).unwrap();
    let held = table
        .timed_get("10.0.0.1", 80, WaitBudget::Immediate)
        .await
        .unwrap();

    let started = Instant::now();
    let err = table
        .timed_get("10.0.0.1", 80, WaitBudget::Immediate)
        .await
        .unwrap_err();
    assert_eq!(err, ConnPoolError::Busy);
    assert!(started.elapsed() < Duration::from_secs(1));

    table.put(&held, ConnOp::Get);
}

#[tokio::test]
async fn bounded_budget_expires_with_timeout() {
    let table = ConnTable::new();
    let n = node("10.0.0.1", 80);
    table.insert(&n).unwrap();
    let held = table
        .timed_get("10.0.0.1", 80, WaitBudget::Immediate)
        .await
        .unwrap();

    let started = Instant::now();
    let err = table
        .timed_get("10.0.0.1", 80, WaitBudget::Bounded(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert_eq!(err, ConnPoolError::Timeout);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(80), "returned too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "budget overshot: {:?}", elapsed);

    table.put(&held, ConnOp::Get);
}

#[tokio::test]
async fn retry_cycle_drives_all_paths_down_and_back() {
    let table = ConnTable::new();
    let n = node("10.0.0.1", 80);
    table.insert(&n).unwrap();

    let got = table
        .timed_get("10.0.0.1", 80, WaitBudget::Immediate)
        .await
        .unwrap();
    got.mark_retry();
    assert_eq!(n.state(), ConnState::Retry);
    assert_eq!(n.retry_attempts(), 1);

    let err = table
        .timed_get("10.0.0.1", 80, WaitBudget::Immediate)
        .await
        .unwrap_err();
    assert_eq!(err, ConnPoolError::AllPathsDown);

    n.mark_ready();
    assert_eq!(n.state(), ConnState::Ready);
    assert_eq!(n.pool().unwrap().idle_connections(), 1);

    let again = table
        .timed_get("10.0.0.1", 80, WaitBudget::Immediate)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&again, &n));
    table.put(&again, ConnOp::Put);
}

#[tokio::test]
async fn failed_node_is_never_handed_out() {
    let table = ConnTable::new();
    let n = node("10.0.0.1", 80);
    table.insert(&n).unwrap();

    let got = table
        .timed_get("10.0.0.1", 80, WaitBudget::Immediate)
        .await
        .unwrap();
    got.mark_failed();
    assert_eq!(n.state(), ConnState::Failed);
    assert!(!n.is_locked());

    let err = table
        .timed_get("10.0.0.1", 80, WaitBudget::Immediate)
        .await
        .unwrap_err();
    assert_eq!(err, ConnPoolError::AllPathsDown);

    // a failed node can still be unlinked, and the emptied pool reports
    // NotFound rather than AllPathsDown
    table.remove(&n).unwrap();
    let err = table
        .timed_get("10.0.0.1", 80, WaitBudget::Immediate)
        .await
        .unwrap_err();
    assert_eq!(err, ConnPoolError::NotFound);
}

#[tokio::test]
async fn remove_of_a_checked_out_node_reports_busy() {
    let table = ConnTable::new();
    let n = node("10.0.0.1", 80);
    table.insert(&n).unwrap();

    let held = table
        .timed_get("10.0.0.1", 80, WaitBudget::Immediate)
        .await
        .unwrap();
    assert_eq!(table.remove(&n).unwrap_err(), ConnPoolError::Busy);

    table.put(&held, ConnOp::Get);
    table.remove(&n).unwrap();
}

#[tokio::test]
async fn peek_is_advisory_and_lockless() {
    let table = ConnTable::new();
    assert!(table.peek("10.0.0.1", 80).is_none());

    let n = node("10.0.0.1", 80);
    table.insert(&n).unwrap();
    let head = table.peek("10.0.0.1", 80).unwrap();
    assert!(Arc::ptr_eq(&head, &n));
    assert!(!head.is_locked());
}

#[tokio::test]
async fn shutdown_sweep_via_first_node_drains_the_table() {
    let table = ConnTable::new();
    for port in [80u16, 81, 82, 83] {
        table.insert(&node("10.0.0.1", port)).unwrap();
    }

    let mut swept = 0;
    while let Some(n) = table.first_node() {
        table.remove(&n).unwrap();
        swept += 1;
    }
    assert_eq!(swept, 4);
    assert_eq!(table.destroy(), 0);
}

#[tokio::test]
async fn dump_reports_per_node_usage() {
    let table = ConnTable::new();
    let n = node("10.0.0.9", 80);
    table.insert(&n).unwrap();

    let got = table
        .timed_get("10.0.0.9", 80, WaitBudget::Immediate)
        .await
        .unwrap();
    got.add_tx_bytes(2048);
    got.add_rx_bytes(1024);
    tokio::time::sleep(Duration::from_millis(5)).await;
    table.put(&got, ConnOp::Get);

    let mut out = Vec::new();
    table.dump(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let mut lines = text.lines();

    assert_eq!(
        lines.next().unwrap(),
        "HOST STATE RETRIES LOOKUPS WAITS AVG_WAIT(us) AVG_LAT_GET(us) AVG_LAT_PUT(us) SEND(kb) RCV(kb)"
    );

    let row = lines.next().expect("one row per node");
    let fields: Vec<&str> = row.split_whitespace().collect();
    assert_eq!(fields.len(), 10);
    assert_eq!(fields[0], "10.0.0.9:80");
    assert_eq!(fields[1], "READY");
    assert_eq!(fields[2], "0"); // retries
    assert_eq!(fields[3], "1"); // lookups
    assert_eq!(fields[4], "0"); // waits
    let avg_get: u64 = fields[6].parse().unwrap();
    assert!(avg_get >= 1_000, "held ~5ms, avg get latency {}us", avg_get);
    assert_eq!(fields[7], "0"); // no PUT-labeled release yet
    assert_eq!(fields[8], "2"); // 2048 bytes sent
    assert_eq!(fields[9], "1"); // 1024 bytes received
    assert!(lines.next().is_none());
}

#[tokio::test]
async fn snapshot_round_trips_through_serde() {
    let table = ConnTable::new();
    table.insert(&node("10.0.0.1", 80)).unwrap();
    table.insert(&node("10.0.0.2", 443)).unwrap();

    let snap = table.snapshot();
    let json = serde_json::to_string(&snap).unwrap();
    let parsed: connpool::registry::TableSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.pools.len(), 2);
    assert!(parsed
        .pools
        .iter()
        .all(|pool| pool.connections == 1 && pool.idle_connections == 1));
}
