//! Pools of scripted transports driven through the full node lifecycle.

use chainpool_core::{
    config::{NodeConfig, PoolSettings},
    NodeState, Pool, PoolBuilder, PoolError, SelectionMode, Transport,
};
use std::{collections::HashSet, sync::Arc, time::Duration};

use crate::mock_infrastructure::{fast_settings, wait_until, MockTransport};

const SETTLE: Duration = Duration::from_secs(3);

fn build_pool(settings: PoolSettings, nodes: &[(NodeConfig, &Arc<MockTransport>)]) -> Pool {
    PoolBuilder::new(1)
        .settings(settings)
        .nodes(nodes.iter().map(|(config, transport)| {
            let transport: Arc<dyn Transport> = Arc::<MockTransport>::clone(transport);
            (config.clone(), transport)
        }))
        .build()
        .unwrap()
}

fn node(name: &str) -> NodeConfig {
    NodeConfig::new(name, format!("http://{name}.local"))
}

fn state_of(pool: &Pool, name: &str) -> Option<NodeState> {
    pool.node(name).map(|n| n.state())
}

#[tokio::test]
async fn test_lagging_node_is_out_of_sync() {
    let a = MockTransport::new(1, 100);
    let b = MockTransport::new(1, 100);
    let c = MockTransport::new(1, 94);
    let pool = build_pool(fast_settings(), &[(node("a"), &a), (node("b"), &b), (node("c"), &c)]);
    pool.start().unwrap();

    let settled = wait_until(SETTLE, || {
        state_of(&pool, "a") == Some(NodeState::InSync)
            && state_of(&pool, "b") == Some(NodeState::InSync)
            && state_of(&pool, "c") == Some(NodeState::OutOfSync)
    })
    .await;
    assert!(settled, "states: {:?}", pool.node_states());

    assert_eq!(pool.select_node().unwrap().name(), "a");
    assert_eq!(pool.live_summary(), (3, 100));

    let ranked: Vec<String> = pool.ranked_nodes().iter().map(|n| n.name().to_string()).collect();
    assert_eq!(ranked, vec!["a", "b", "c"]);

    pool.stop().await;
}

#[tokio::test]
async fn test_out_of_sync_node_catches_up() {
    let a = MockTransport::new(1, 100);
    let c = MockTransport::new(1, 90);
    let pool = build_pool(fast_settings(), &[(node("a"), &a), (node("c"), &c)]);
    pool.start().unwrap();

    assert!(wait_until(SETTLE, || state_of(&pool, "c") == Some(NodeState::OutOfSync)).await);

    c.set_head(99);
    assert!(wait_until(SETTLE, || state_of(&pool, "c") == Some(NodeState::InSync)).await);
    assert_eq!(pool.node("c").unwrap().highest_reported_block(), 99);

    pool.stop().await;
}

#[tokio::test]
async fn test_stale_flag_follows_lag_duration() {
    let settings = PoolSettings { very_old_head_threshold_ms: 60, ..fast_settings() };
    let a = MockTransport::new(1, 100);
    let c = MockTransport::new(1, 50);
    let pool = build_pool(settings, &[(node("a"), &a), (node("c"), &c)]);
    pool.start().unwrap();

    let lagging = pool.node("c").unwrap();
    assert!(wait_until(SETTLE, || lagging.is_stale()).await);
    assert_eq!(lagging.state(), NodeState::OutOfSync);

    c.set_head(100);
    assert!(wait_until(SETTLE, || !lagging.is_stale()).await);
    assert!(wait_until(SETTLE, || lagging.state() == NodeState::InSync).await);

    pool.stop().await;
}

#[tokio::test]
async fn test_node_serving_older_head_stays_in_sync() {
    let settings = PoolSettings { very_old_head_threshold_ms: 60, ..fast_settings() };
    let a = MockTransport::new(1, 100);
    let pool = build_pool(settings, &[(node("a"), &a)]);
    pool.start().unwrap();
    assert!(wait_until(SETTLE, || state_of(&pool, "a") == Some(NodeState::InSync)).await);

    // A load balancer in front of the endpoint briefly answers from a lagging backend.
    a.set_head(90);
    let node = pool.node("a").unwrap();
    assert!(wait_until(SETTLE, || node.latest_head().map(|h| h.number) == Some(90)).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(node.state(), NodeState::InSync);
    assert!(!node.is_stale());
    assert_eq!(node.highest_reported_block(), 100);
    assert_eq!(node.counters().transitions_to(NodeState::OutOfSync), 0);

    pool.stop().await;
}

#[tokio::test]
async fn test_wrong_chain_is_excluded_for_good() {
    let a = MockTransport::new(1, 100);
    let b = MockTransport::new(1, 100);
    let wrong = MockTransport::new(2, 100);
    let pool = build_pool(
        fast_settings(),
        &[(node("a"), &a), (node("b"), &b), (node("wrong").with_order(1), &wrong)],
    );
    pool.start().unwrap();

    let settled = wait_until(SETTLE, || {
        state_of(&pool, "wrong") == Some(NodeState::InvalidChainId)
            && state_of(&pool, "a") == Some(NodeState::InSync)
            && state_of(&pool, "b") == Some(NodeState::InSync)
    })
    .await;
    assert!(settled, "states: {:?}", pool.node_states());

    // Best priority, but never eligible.
    assert_eq!(pool.select_node().unwrap().name(), "a");
    assert_eq!(pool.node("wrong").unwrap().chain_id(), None);

    // Fixing the endpoint does not bring it back before a restart.
    wrong.set_chain_id(1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(state_of(&pool, "wrong"), Some(NodeState::InvalidChainId));
    assert!(pool.ranked_nodes().iter().all(|n| n.name() != "wrong"));

    pool.stop().await;
}

#[tokio::test]
async fn test_consecutive_poll_failures_make_node_unreachable() {
    let a = MockTransport::new(1, 100);
    let pool = build_pool(fast_settings(), &[(node("a"), &a)]);
    pool.start().unwrap();
    assert!(wait_until(SETTLE, || state_of(&pool, "a") == Some(NodeState::InSync)).await);

    a.set_dial_ok(false);
    a.set_fail_heads(true);
    assert!(wait_until(SETTLE, || state_of(&pool, "a") == Some(NodeState::Unreachable)).await);

    let failed = pool.node("a").unwrap();
    let history = failed.poll_history(5);
    assert_eq!(history.len(), 5);
    assert!(history.iter().all(|record| !record.success));
    assert!(a.close_count() >= 1);
    assert_eq!(pool.select_node().unwrap_err(), PoolError::NoLiveNodes { chain_id: 1 });

    let counters = failed.counters();
    assert_eq!(counters.transitions_to(NodeState::Unreachable), 1);
    assert!(counters.polls_failed >= 5);

    pool.stop().await;
}

#[tokio::test]
async fn test_unreachable_node_recovers() {
    let a = MockTransport::new(1, 100);
    let pool = build_pool(fast_settings(), &[(node("a"), &a)]);
    pool.start().unwrap();
    assert!(wait_until(SETTLE, || state_of(&pool, "a") == Some(NodeState::InSync)).await);

    a.set_dial_ok(false);
    a.set_fail_heads(true);
    assert!(wait_until(SETTLE, || state_of(&pool, "a") == Some(NodeState::Unreachable)).await);

    let dials_while_down = a.dial_count();
    assert!(wait_until(SETTLE, || a.dial_count() >= dials_while_down + 2).await);

    a.set_head(120);
    a.set_fail_heads(false);
    a.set_dial_ok(true);
    assert!(wait_until(SETTLE, || state_of(&pool, "a") == Some(NodeState::InSync)).await);

    let recovered = pool.select_node().unwrap();
    assert_eq!(recovered.name(), "a");
    assert_eq!(recovered.highest_reported_block(), 120);
    assert_eq!(recovered.consecutive_failures(), 0);
    assert!(recovered.counters().transitions_to(NodeState::Alive) >= 2);

    pool.stop().await;
}

#[tokio::test]
async fn test_dial_retries_until_endpoint_comes_up() {
    let a = MockTransport::new(1, 100);
    a.set_dial_ok(false);
    let pool = build_pool(fast_settings(), &[(node("a"), &a)]);
    pool.start().unwrap();

    assert!(wait_until(SETTLE, || a.dial_count() >= 3).await);
    assert_eq!(state_of(&pool, "a"), Some(NodeState::Unreachable));
    assert!(pool.select_node().is_err());

    a.set_dial_ok(true);
    assert!(wait_until(SETTLE, || state_of(&pool, "a") == Some(NodeState::InSync)).await);
    assert_eq!(pool.node("a").unwrap().chain_id(), Some(1));

    pool.stop().await;
}

#[tokio::test]
async fn test_closed_subscription_makes_node_unreachable() {
    let settings = PoolSettings { subscribe_new_heads: true, ..fast_settings() };
    let a = MockTransport::new(1, 100).with_subscriptions();
    let pool = build_pool(settings, &[(node("a"), &a)]);
    pool.start().unwrap();

    assert!(
        wait_until(SETTLE, || a.has_subscription() && state_of(&pool, "a") == Some(NodeState::InSync))
            .await
    );

    assert!(a.push_head(105).await);
    let subscribed = pool.node("a").unwrap();
    assert!(wait_until(SETTLE, || subscribed.highest_reported_block() == 105).await);

    a.set_dial_ok(false);
    a.drop_subscription();
    assert!(wait_until(SETTLE, || subscribed.state() == NodeState::Unreachable).await);
    assert!(a.close_count() >= 1);

    pool.stop().await;
}

#[tokio::test]
async fn test_disabled_node_is_never_dialed() {
    let a = MockTransport::new(1, 100);
    let off = MockTransport::new(1, 100);
    let pool = build_pool(fast_settings(), &[(node("a"), &a), (node("off").with_order(1).disabled(), &off)]);
    pool.start().unwrap();

    assert!(wait_until(SETTLE, || state_of(&pool, "a") == Some(NodeState::InSync)).await);
    assert_eq!(state_of(&pool, "off"), Some(NodeState::Unusable));
    assert_eq!(off.dial_count(), 0);
    assert_eq!(pool.select_node().unwrap().name(), "a");

    pool.stop().await;
}

#[tokio::test]
async fn test_mark_unusable_stops_polling() {
    let a = MockTransport::new(1, 100);
    let pool = build_pool(fast_settings(), &[(node("a"), &a)]);
    pool.start().unwrap();
    assert!(wait_until(SETTLE, || state_of(&pool, "a") == Some(NodeState::InSync)).await);

    pool.mark_unusable("a").unwrap();
    assert_eq!(pool.select_node().unwrap_err(), PoolError::NoLiveNodes { chain_id: 1 });

    // The poller closes the transport on its way out.
    assert!(wait_until(SETTLE, || a.close_count() >= 1).await);
    let polls = a.head_poll_count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a.head_poll_count(), polls);
    assert_eq!(state_of(&pool, "a"), Some(NodeState::Unusable));

    pool.stop().await;
}

#[tokio::test]
async fn test_round_robin_spreads_selections() {
    let settings = PoolSettings { selection_mode: SelectionMode::RoundRobin, ..fast_settings() };
    let transports: Vec<Arc<MockTransport>> = (0..3).map(|_| MockTransport::new(1, 100)).collect();
    let configs = [node("a"), node("b"), node("c")];
    let nodes: Vec<(NodeConfig, &Arc<MockTransport>)> =
        configs.iter().cloned().zip(transports.iter()).collect();
    let pool = build_pool(settings, &nodes);
    pool.start().unwrap();

    assert!(
        wait_until(SETTLE, || pool.node_states().values().all(|s| *s == NodeState::InSync)).await
    );

    let picked: HashSet<String> =
        (0..3).map(|_| pool.select_node().unwrap().name().to_string()).collect();
    assert_eq!(picked.len(), 3);

    pool.stop().await;
}

#[tokio::test]
async fn test_highest_head_prefers_most_advanced_node() {
    let settings = PoolSettings { selection_mode: SelectionMode::HighestHead, ..fast_settings() };
    let a = MockTransport::new(1, 100);
    let b = MockTransport::new(1, 103);
    let pool = build_pool(settings, &[(node("a").with_order(1), &a), (node("b").with_order(9), &b)]);
    pool.start().unwrap();

    let settled = wait_until(SETTLE, || {
        state_of(&pool, "a") == Some(NodeState::InSync)
            && state_of(&pool, "b") == Some(NodeState::InSync)
    })
    .await;
    assert!(settled, "states: {:?}", pool.node_states());
    assert_eq!(pool.select_node().unwrap().name(), "b");

    pool.stop().await;
}

#[tokio::test]
async fn test_stop_halts_pollers_and_closes_transports() {
    let a = MockTransport::new(1, 100);
    let b = MockTransport::new(1, 100);
    let pool = build_pool(fast_settings(), &[(node("a"), &a), (node("b"), &b)]);
    pool.start().unwrap();
    assert!(wait_until(SETTLE, || a.head_poll_count() >= 2 && b.head_poll_count() >= 2).await);

    pool.stop().await;
    assert!(!pool.is_running());
    assert!(a.close_count() >= 1);
    assert!(b.close_count() >= 1);

    let polls = (a.head_poll_count(), b.head_poll_count());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!((a.head_poll_count(), b.head_poll_count()), polls);

    let closes = a.close_count();
    pool.stop().await;
    assert_eq!(a.close_count(), closes);
    assert_eq!(pool.start().unwrap_err(), PoolError::Stopped);
}

#[tokio::test]
async fn test_status_snapshot_serializes() {
    let a = MockTransport::new(1, 100);
    let pool = build_pool(fast_settings(), &[(node("a"), &a)]);
    pool.start().unwrap();
    assert!(wait_until(SETTLE, || state_of(&pool, "a") == Some(NodeState::InSync)).await);

    let status = serde_json::to_value(pool.nodes()).unwrap();
    assert_eq!(status[0]["name"], "a");
    assert_eq!(status[0]["state"], "in_sync");
    assert_eq!(status[0]["chain_id"], 1);
    assert_eq!(status[0]["highest_reported_block"], 100);

    pool.stop().await;
}

#[tokio::test]
async fn test_active_node_sticks_until_outranked() {
    let a = MockTransport::new(1, 100);
    let b = MockTransport::new(1, 100);
    let pool = build_pool(
        fast_settings(),
        &[(node("a").with_order(1), &a), (node("b").with_order(2), &b)],
    );
    pool.start().unwrap();

    let both_in_sync = || {
        state_of(&pool, "a") == Some(NodeState::InSync)
            && state_of(&pool, "b") == Some(NodeState::InSync)
    };
    assert!(wait_until(SETTLE, both_in_sync).await);
    assert_eq!(pool.select_node().unwrap().name(), "a");

    b.set_head(110);
    assert!(wait_until(SETTLE, || state_of(&pool, "a") == Some(NodeState::OutOfSync)).await);
    assert_eq!(pool.select_node().unwrap().name(), "b");

    // Back in sync with a better order, but only ties on rank: the pool stays on b.
    a.set_head(110);
    assert!(wait_until(SETTLE, both_in_sync).await);
    assert_eq!(pool.select_node().unwrap().name(), "b");
    assert_eq!(pool.active_node().map(|n| n.name().to_string()), Some("b".to_string()));
    assert_eq!(pool.active_node_switches(), 2);

    pool.stop().await;
}

#[tokio::test]
async fn test_lease_returns_to_preferred_node() {
    let settings = PoolSettings { lease_duration_ms: 50, ..fast_settings() };
    let a = MockTransport::new(1, 100);
    let b = MockTransport::new(1, 100);
    let pool =
        build_pool(settings, &[(node("a").with_order(1), &a), (node("b").with_order(2), &b)]);
    pool.start().unwrap();

    a.set_dial_ok(false);
    a.set_fail_heads(true);
    assert!(wait_until(SETTLE, || state_of(&pool, "b") == Some(NodeState::InSync)).await);
    assert!(wait_until(SETTLE, || state_of(&pool, "a") == Some(NodeState::Unreachable)).await);
    assert_eq!(pool.select_node().unwrap().name(), "b");

    a.set_fail_heads(false);
    a.set_dial_ok(true);
    assert!(wait_until(SETTLE, || state_of(&pool, "a") == Some(NodeState::InSync)).await);
    assert!(
        wait_until(SETTLE, || pool.active_node().is_some_and(|n| n.name() == "a")).await,
        "lease never moved the pool back to a"
    );
    assert_eq!(pool.select_node().unwrap().name(), "a");

    pool.stop().await;
}

#[tokio::test]
async fn test_round_robin_has_no_active_node() {
    let settings = PoolSettings {
        selection_mode: SelectionMode::RoundRobin,
        lease_duration_ms: 20,
        ..fast_settings()
    };
    let a = MockTransport::new(1, 100);
    let b = MockTransport::new(1, 100);
    let pool = build_pool(settings, &[(node("a"), &a), (node("b"), &b)]);
    pool.start().unwrap();

    let settled = wait_until(SETTLE, || {
        state_of(&pool, "a") == Some(NodeState::InSync)
            && state_of(&pool, "b") == Some(NodeState::InSync)
    })
    .await;
    assert!(settled, "states: {:?}", pool.node_states());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let picked: HashSet<String> =
        (0..2).map(|_| pool.select_node().unwrap().name().to_string()).collect();
    assert_eq!(picked.len(), 2);
    assert!(pool.active_node().is_none());
    assert_eq!(pool.active_node_switches(), 0);

    pool.stop().await;
}

#[tokio::test]
async fn test_node_without_new_heads_goes_out_of_sync() {
    // Lag detection off, so only the silence rule can demote a.
    let settings =
        PoolSettings { sync_threshold: 0, no_new_heads_threshold_ms: 100, ..fast_settings() };
    let a = MockTransport::new(1, 100);
    let b = MockTransport::new(1, 100);
    let pool = build_pool(settings, &[(node("a"), &a), (node("b"), &b)]);
    pool.start().unwrap();

    let producer = {
        let b = Arc::clone(&b);
        tokio::spawn(async move {
            for number in 101_u64.. {
                b.set_head(number);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
    };

    assert!(wait_until(SETTLE, || state_of(&pool, "a") == Some(NodeState::OutOfSync)).await);
    assert_eq!(state_of(&pool, "b"), Some(NodeState::InSync));

    a.set_head(1_000_000);
    assert!(wait_until(SETTLE, || state_of(&pool, "a") == Some(NodeState::InSync)).await);

    producer.abort();
    pool.stop().await;
}

#[tokio::test]
async fn test_last_live_node_is_kept_without_new_heads() {
    let settings = PoolSettings { no_new_heads_threshold_ms: 50, ..fast_settings() };
    let a = MockTransport::new(1, 100);
    let pool = build_pool(settings, &[(node("a"), &a)]);
    pool.start().unwrap();
    assert!(wait_until(SETTLE, || state_of(&pool, "a") == Some(NodeState::InSync)).await);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(state_of(&pool, "a"), Some(NodeState::InSync));
    assert_eq!(pool.select_node().unwrap().name(), "a");

    pool.stop().await;
}
