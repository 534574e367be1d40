//! Pools of `HttpTransport`s against mockito JSON-RPC servers.

use chainpool_core::{
    config::{ChainConfig, NodeConfig},
    ChainSet, NodeState, PoolError,
};
use serde_json::json;
use std::time::Duration;

use crate::mock_infrastructure::{create_test_block, fast_settings, wait_until, RpcMockBuilder};

const SETTLE: Duration = Duration::from_secs(5);

fn chain(chain_id: u64, endpoints: &[(&str, String)]) -> ChainConfig {
    ChainConfig {
        chain_id,
        pool: fast_settings(),
        nodes: endpoints.iter().map(|(name, url)| NodeConfig::new(*name, url.clone())).collect(),
    }
}

#[tokio::test]
async fn test_http_nodes_become_in_sync() {
    let mut primary = RpcMockBuilder::new().await;
    primary.mock_healthy_node(137, &create_test_block(5_000)).await;
    primary.mock_block_number(5_000).await;
    let mut backup = RpcMockBuilder::new().await;
    backup.mock_healthy_node(137, &create_test_block(4_998)).await;

    let set = ChainSet::with_http_transports(&[chain(
        137,
        &[("primary", primary.url()), ("backup", backup.url())],
    )])
    .unwrap();
    set.start_all().unwrap();
    let pool = set.pool(137).unwrap();

    let settled = wait_until(SETTLE, || {
        pool.node_states().values().all(|state| *state == NodeState::InSync)
    })
    .await;
    assert!(settled, "states: {:?}", pool.node_states());
    assert_eq!(pool.live_summary(), (2, 5_000));

    let node = pool.select_node().unwrap();
    assert_eq!(node.name(), "primary");
    assert_eq!(node.chain_id(), Some(137));
    assert_eq!(node.call("eth_blockNumber", json!([])).await.unwrap(), json!("0x1388"));

    let status = node.status();
    assert_eq!(status.latency.get("eth_blockNumber").map(|l| l.samples), Some(1));
    assert!(status.latest_head.and_then(|h| h.hash).is_some());

    set.stop_all().await;
}

#[tokio::test]
async fn test_http_node_on_wrong_chain() {
    let mut server = RpcMockBuilder::new().await;
    server.mock_healthy_node(10, &create_test_block(1)).await;

    let set = ChainSet::with_http_transports(&[chain(1, &[("optimism", server.url())])]).unwrap();
    set.start_all().unwrap();
    let pool = set.pool(1).unwrap();

    let node = pool.node("optimism").unwrap();
    assert!(wait_until(SETTLE, || node.state() == NodeState::InvalidChainId).await);
    assert_eq!(pool.select_node().unwrap_err(), PoolError::NoLiveNodes { chain_id: 1 });

    set.stop_all().await;
}

#[tokio::test]
async fn test_http_node_behind_failing_server_stays_unreachable() {
    let mut server = RpcMockBuilder::new().await;
    server.mock_server_error().await;

    let set = ChainSet::with_http_transports(&[chain(1, &[("down", server.url())])]).unwrap();
    set.start_all().unwrap();
    let pool = set.pool(1).unwrap();
    let node = pool.node("down").unwrap();

    assert!(wait_until(SETTLE, || node.counters().dials_failed >= 2).await);
    assert_eq!(node.state(), NodeState::Unreachable);
    assert_eq!(node.counters().dials_success, 0);
    assert!(pool.select_node().is_err());

    set.stop_all().await;
}

#[tokio::test]
async fn test_http_node_goes_down_then_recovers() {
    let mut server = RpcMockBuilder::new().await;
    server.mock_healthy_node(1, &create_test_block(100)).await;

    let set = ChainSet::with_http_transports(&[chain(1, &[("flaky", server.url())])]).unwrap();
    set.start_all().unwrap();
    let pool = set.pool(1).unwrap();
    let node = pool.node("flaky").unwrap();
    assert!(wait_until(SETTLE, || node.state() == NodeState::InSync).await);

    server.reset();
    server.mock_server_error().await;
    assert!(wait_until(SETTLE, || node.state() == NodeState::Unreachable).await);
    assert!(pool.select_node().is_err());

    server.reset();
    server.mock_healthy_node(1, &create_test_block(110)).await;
    assert!(wait_until(SETTLE, || node.state() == NodeState::InSync).await);
    assert_eq!(node.highest_reported_block(), 110);

    set.stop_all().await;
}
