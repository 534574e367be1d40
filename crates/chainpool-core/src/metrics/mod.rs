//! # Node Metrics
//!
//! Every node owns a [`NodeMetrics`] recorder. Each event is recorded twice:
//!
//! - through the `metrics` facade, labelled `evmChainID` and `nodeName`, for whatever
//!   exporter the process installed (the node binary installs Prometheus);
//! - into in-process atomic counters, so [`NodeStatus`](crate::node::NodeStatus)
//!   snapshots and tests can read totals without an exporter.
//!
//! Without an installed recorder the facade calls are no-ops.
//!
//! ## Exported series
//!
//! | Name | Kind | Extra labels |
//! |------|------|--------------|
//! | `evm_pool_rpc_node_polls_{total,success,failed}` | counter | |
//! | `evm_pool_rpc_node_dials_{total,success,failed}` | counter | |
//! | `evm_pool_rpc_node_verifies`, `..._verifies_{success,failed}` | counter | |
//! | `evm_pool_rpc_node_num_transitions_to_<state>` | counter | |
//! | `evm_pool_rpc_node_highest_seen_block` | gauge | |
//! | `evm_pool_rpc_node_num_seen_blocks` | counter | |
//! | `evm_pool_rpc_node_calls_{total,success}` | counter | |
//! | `evm_pool_rpc_node_states` | gauge | `state` |
//! | `evm_pool_rpc_node_stale` | gauge | |
//! | `evm_pool_rpc_node_rpc_call_time` | histogram (ns) | `rpcCallName` |
//! | `evm_pool_rpc_active_node_switches` | counter | `nodeName` is the new active node |

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use std::{
    borrow::Cow,
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crate::{node::NodeState, transport::TransportError};

/// Stable metric label for states and error kinds.
pub trait MetricsState {
    fn as_metric_str(&self) -> &'static str;
}

impl MetricsState for NodeState {
    fn as_metric_str(&self) -> &'static str {
        self.as_str()
    }
}

impl MetricsState for TransportError {
    fn as_metric_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::Rpc(..) => "rpc_error",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Unsupported => "unsupported",
            Self::Closed => "closed",
            Self::Network(_) => "network_error",
        }
    }
}

#[inline]
fn call_name_label(method: &str) -> Cow<'static, str> {
    match method {
        "eth_chainId" => Cow::Borrowed("eth_chainId"),
        "eth_blockNumber" => Cow::Borrowed("eth_blockNumber"),
        "eth_getBlockByNumber" => Cow::Borrowed("eth_getBlockByNumber"),
        "eth_getBlockByHash" => Cow::Borrowed("eth_getBlockByHash"),
        "eth_call" => Cow::Borrowed("eth_call"),
        "eth_estimateGas" => Cow::Borrowed("eth_estimateGas"),
        "eth_gasPrice" => Cow::Borrowed("eth_gasPrice"),
        "eth_getLogs" => Cow::Borrowed("eth_getLogs"),
        "eth_getTransactionReceipt" => Cow::Borrowed("eth_getTransactionReceipt"),
        "eth_getTransactionCount" => Cow::Borrowed("eth_getTransactionCount"),
        "eth_sendRawTransaction" => Cow::Borrowed("eth_sendRawTransaction"),
        _ => Cow::Owned(method.to_string()),
    }
}

#[derive(Default)]
struct Cells {
    polls_total: AtomicU64,
    polls_success: AtomicU64,
    polls_failed: AtomicU64,
    dials_total: AtomicU64,
    dials_success: AtomicU64,
    dials_failed: AtomicU64,
    verifies_total: AtomicU64,
    verifies_success: AtomicU64,
    verifies_failed: AtomicU64,
    seen_blocks: AtomicU64,
    calls_total: AtomicU64,
    calls_success: AtomicU64,
    transitions: [AtomicU64; NodeState::ALL.len()],
}

/// Point-in-time copy of a node's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeCounters {
    pub polls_total: u64,
    pub polls_success: u64,
    pub polls_failed: u64,
    pub dials_total: u64,
    pub dials_success: u64,
    pub dials_failed: u64,
    pub verifies_total: u64,
    pub verifies_success: u64,
    pub verifies_failed: u64,
    pub seen_blocks: u64,
    pub calls_total: u64,
    pub calls_success: u64,
    /// Transitions into each state, keyed by state name.
    pub transitions: BTreeMap<&'static str, u64>,
}

impl NodeCounters {
    #[must_use]
    pub fn transitions_to(&self, state: NodeState) -> u64 {
        self.transitions.get(state.as_str()).copied().unwrap_or(0)
    }
}

/// Metrics recorder for one node.
pub struct NodeMetrics {
    chain_id: String,
    node_name: String,
    cells: Cells,
}

fn state_index(state: NodeState) -> usize {
    NodeState::ALL.iter().position(|s| *s == state).unwrap_or(0)
}

impl NodeMetrics {
    #[must_use]
    pub fn new(chain_id: u64, node_name: &str) -> Self {
        Self { chain_id: chain_id.to_string(), node_name: node_name.to_string(), cells: Cells::default() }
    }

    /// Publishes the initial state gauge: 1 for `state`, 0 for every other state.
    pub fn init_state(&self, state: NodeState) {
        for s in NodeState::ALL {
            gauge!(
                "evm_pool_rpc_node_states",
                "evmChainID" => self.chain_id.clone(),
                "nodeName" => self.node_name.clone(),
                "state" => s.as_metric_str()
            )
            .set(if s == state { 1.0 } else { 0.0 });
        }
        gauge!("evm_pool_rpc_node_stale", "evmChainID" => self.chain_id.clone(), "nodeName" => self.node_name.clone()).set(0.0);
    }

    pub fn record_poll(&self, success: bool) {
        self.cells.polls_total.fetch_add(1, Ordering::Relaxed);
        counter!("evm_pool_rpc_node_polls_total", "evmChainID" => self.chain_id.clone(), "nodeName" => self.node_name.clone()).increment(1);
        if success {
            self.cells.polls_success.fetch_add(1, Ordering::Relaxed);
            counter!("evm_pool_rpc_node_polls_success", "evmChainID" => self.chain_id.clone(), "nodeName" => self.node_name.clone()).increment(1);
        } else {
            self.cells.polls_failed.fetch_add(1, Ordering::Relaxed);
            counter!("evm_pool_rpc_node_polls_failed", "evmChainID" => self.chain_id.clone(), "nodeName" => self.node_name.clone()).increment(1);
        }
    }

    pub fn record_dial(&self, success: bool) {
        self.cells.dials_total.fetch_add(1, Ordering::Relaxed);
        counter!("evm_pool_rpc_node_dials_total", "evmChainID" => self.chain_id.clone(), "nodeName" => self.node_name.clone()).increment(1);
        if success {
            self.cells.dials_success.fetch_add(1, Ordering::Relaxed);
            counter!("evm_pool_rpc_node_dials_success", "evmChainID" => self.chain_id.clone(), "nodeName" => self.node_name.clone()).increment(1);
        } else {
            self.cells.dials_failed.fetch_add(1, Ordering::Relaxed);
            counter!("evm_pool_rpc_node_dials_failed", "evmChainID" => self.chain_id.clone(), "nodeName" => self.node_name.clone()).increment(1);
        }
    }

    pub fn record_verify(&self, success: bool) {
        self.cells.verifies_total.fetch_add(1, Ordering::Relaxed);
        counter!("evm_pool_rpc_node_verifies", "evmChainID" => self.chain_id.clone(), "nodeName" => self.node_name.clone()).increment(1);
        if success {
            self.cells.verifies_success.fetch_add(1, Ordering::Relaxed);
            counter!("evm_pool_rpc_node_verifies_success", "evmChainID" => self.chain_id.clone(), "nodeName" => self.node_name.clone()).increment(1);
        } else {
            self.cells.verifies_failed.fetch_add(1, Ordering::Relaxed);
            counter!("evm_pool_rpc_node_verifies_failed", "evmChainID" => self.chain_id.clone(), "nodeName" => self.node_name.clone()).increment(1);
        }
    }

    /// Counts a transition into `to` and moves the state gauge from `from` to `to`.
    pub fn record_transition(&self, from: NodeState, to: NodeState) {
        self.cells.transitions[state_index(to)].fetch_add(1, Ordering::Relaxed);

        let name = format!("evm_pool_rpc_node_num_transitions_to_{}", to.as_metric_str());
        counter!(name, "evmChainID" => self.chain_id.clone(), "nodeName" => self.node_name.clone()).increment(1);

        gauge!(
            "evm_pool_rpc_node_states",
            "evmChainID" => self.chain_id.clone(),
            "nodeName" => self.node_name.clone(),
            "state" => from.as_metric_str()
        )
        .set(0.0);
        gauge!(
            "evm_pool_rpc_node_states",
            "evmChainID" => self.chain_id.clone(),
            "nodeName" => self.node_name.clone(),
            "state" => to.as_metric_str()
        )
        .set(1.0);
    }

    /// Counts a received head and publishes the node's highest block.
    pub fn record_seen_block(&self, highest: u64) {
        self.cells.seen_blocks.fetch_add(1, Ordering::Relaxed);
        counter!("evm_pool_rpc_node_num_seen_blocks", "evmChainID" => self.chain_id.clone(), "nodeName" => self.node_name.clone()).increment(1);
        #[allow(clippy::cast_precision_loss)]
        gauge!("evm_pool_rpc_node_highest_seen_block", "evmChainID" => self.chain_id.clone(), "nodeName" => self.node_name.clone()).set(highest as f64);
    }

    pub fn set_stale(&self, stale: bool) {
        gauge!("evm_pool_rpc_node_stale", "evmChainID" => self.chain_id.clone(), "nodeName" => self.node_name.clone())
            .set(if stale { 1.0 } else { 0.0 });
    }

    pub fn record_call(&self, method: &str, success: bool, elapsed: Duration) {
        self.cells.calls_total.fetch_add(1, Ordering::Relaxed);
        counter!("evm_pool_rpc_node_calls_total", "evmChainID" => self.chain_id.clone(), "nodeName" => self.node_name.clone()).increment(1);
        if success {
            self.cells.calls_success.fetch_add(1, Ordering::Relaxed);
            counter!("evm_pool_rpc_node_calls_success", "evmChainID" => self.chain_id.clone(), "nodeName" => self.node_name.clone()).increment(1);
        }
        #[allow(clippy::cast_precision_loss)]
        histogram!(
            "evm_pool_rpc_node_rpc_call_time",
            "evmChainID" => self.chain_id.clone(),
            "nodeName" => self.node_name.clone(),
            "rpcCallName" => call_name_label(method)
        )
        .record(elapsed.as_nanos() as f64);
    }

    #[must_use]
    pub fn snapshot(&self) -> NodeCounters {
        let load = |cell: &AtomicU64| cell.load(Ordering::Relaxed);
        let c = &self.cells;
        NodeCounters {
            polls_total: load(&c.polls_total),
            polls_success: load(&c.polls_success),
            polls_failed: load(&c.polls_failed),
            dials_total: load(&c.dials_total),
            dials_success: load(&c.dials_success),
            dials_failed: load(&c.dials_failed),
            verifies_total: load(&c.verifies_total),
            verifies_success: load(&c.verifies_success),
            verifies_failed: load(&c.verifies_failed),
            seen_blocks: load(&c.seen_blocks),
            calls_total: load(&c.calls_total),
            calls_success: load(&c.calls_success),
            transitions: NodeState::ALL
                .iter()
                .zip(c.transitions.iter())
                .map(|(state, count)| (state.as_str(), load(count)))
                .collect(),
        }
    }
}
