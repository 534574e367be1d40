//! A single RPC endpoint and its health state.
//!
//! All mutable health data lives in one [`parking_lot::RwLock`] per node, so readers (the
//! selector, status snapshots) never wait on another node and never await. Only the node's
//! own [`poller`] writes state, plus the operator action [`Node::mark_unusable`].

pub mod dialer;
pub mod latency_tracker;
pub(crate) mod poller;
pub mod state;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    config::{NodeConfig, PoolSettings},
    metrics::{MetricsState, NodeCounters, NodeMetrics},
    transport::{Transport, TransportError},
    types::Head,
};

pub use dialer::{BackoffPolicy, DialError, Dialer};
pub use latency_tracker::{LatencySummary, LatencyTracker};
pub use state::NodeState;

const POLL_HISTORY_SIZE: usize = 64;

/// Outcome of one head poll.
#[derive(Debug, Clone, Serialize)]
pub struct PollRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub block_number: Option<u64>,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// Serializable point-in-time view of a node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub order: u32,
    pub state: NodeState,
    pub state_since: DateTime<Utc>,
    pub chain_id: Option<u64>,
    pub highest_reported_block: u64,
    pub latest_head: Option<Head>,
    pub consecutive_failures: u32,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_poll_success: Option<bool>,
    /// Lagging the pool's best head for longer than the very-old-head threshold.
    pub stale: bool,
    pub counters: NodeCounters,
    /// Per-method latency of calls issued through [`Node::call`].
    pub latency: BTreeMap<String, LatencySummary>,
}

/// Inputs the selector needs, read under one lock acquisition.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SelectionView {
    pub state: NodeState,
    pub highest_block: u64,
}

#[derive(Debug)]
struct NodeInner {
    state: NodeState,
    state_since: DateTime<Utc>,
    /// Set on the first successful verification and never changed afterwards.
    chain_id: Option<u64>,
    highest_reported_block: u64,
    latest_head: Option<Head>,
    consecutive_failures: u32,
    last_poll_at: Option<DateTime<Utc>>,
    last_poll_success: Option<bool>,
    lagging_since: Option<Instant>,
    stale: bool,
    /// Last time `highest_reported_block` moved forward, or the node became `Alive`.
    last_head_advance: Option<Instant>,
    silence_reported: bool,
}

/// One configured endpoint of a [`Pool`](crate::pool::Pool).
pub struct Node {
    config: NodeConfig,
    expected_chain_id: u64,
    transport: Arc<dyn Transport>,
    inner: RwLock<NodeInner>,
    dialer: Dialer,
    latency: DashMap<String, LatencyTracker>,
    metrics: NodeMetrics,
    poll_history: RwLock<VecDeque<PollRecord>>,
    call_timeout: Duration,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.config.name)
            .field("expected_chain_id", &self.expected_chain_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Creates a node in `Unreachable`, or in `Unusable` when its configuration disables it.
    #[must_use]
    pub fn new(
        config: NodeConfig,
        expected_chain_id: u64,
        transport: Arc<dyn Transport>,
        settings: &PoolSettings,
    ) -> Self {
        let state = if config.disabled { NodeState::Unusable } else { NodeState::Unreachable };
        let metrics = NodeMetrics::new(expected_chain_id, &config.name);
        metrics.init_state(state);

        Self {
            dialer: Dialer::new(settings.dial_backoff(), settings.dial_timeout()),
            call_timeout: settings.call_timeout(),
            config,
            expected_chain_id,
            transport,
            inner: RwLock::new(NodeInner {
                state,
                state_since: Utc::now(),
                chain_id: None,
                highest_reported_block: 0,
                latest_head: None,
                consecutive_failures: 0,
                last_poll_at: None,
                last_poll_success: None,
                lagging_since: None,
                stale: false,
                last_head_advance: None,
                silence_reported: false,
            }),
            latency: DashMap::new(),
            metrics,
            poll_history: RwLock::new(VecDeque::with_capacity(POLL_HISTORY_SIZE)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[must_use]
    pub fn expected_chain_id(&self) -> u64 {
        self.expected_chain_id
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        self.inner.read().state
    }

    /// Chain id confirmed by the last successful verification.
    #[must_use]
    pub fn chain_id(&self) -> Option<u64> {
        self.inner.read().chain_id
    }

    #[must_use]
    pub fn highest_reported_block(&self) -> u64 {
        self.inner.read().highest_reported_block
    }

    #[must_use]
    pub fn latest_head(&self) -> Option<Head> {
        self.inner.read().latest_head.clone()
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.read().consecutive_failures
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.inner.read().stale
    }

    #[must_use]
    pub fn counters(&self) -> NodeCounters {
        self.metrics.snapshot()
    }

    /// Raw transport, for callers that need capabilities beyond [`Node::call`].
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    pub(crate) fn selection_view(&self) -> SelectionView {
        let inner = self.inner.read();
        SelectionView { state: inner.state, highest_block: inner.highest_reported_block }
    }

    /// Issues an RPC through the node's transport, bounded by the pool's call timeout.
    ///
    /// Records call counters, the `rpc_call_time` histogram and the per-method latency
    /// window. Call failures do not affect node health; only the poller judges health.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] if the call exceeds the timeout, or the
    /// transport's own error.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let start = Instant::now();
        let result = tokio::time::timeout(self.call_timeout, self.transport.call(method, params))
            .await
            .unwrap_or(Err(TransportError::Timeout));
        let elapsed = start.elapsed();

        self.metrics.record_call(method, result.is_ok(), elapsed);
        self.latency.entry(method.to_string()).or_default().record(elapsed);

        if let Err(ref e) = result {
            tracing::debug!(
                node = %self.config.name,
                method = method,
                error = %e,
                "rpc call failed"
            );
        }
        result
    }

    /// Removes the node from service permanently. Returns `false` if it was already terminal.
    ///
    /// The node's poller notices on its next wake-up, closes the transport and exits.
    pub fn mark_unusable(&self) -> bool {
        self.transition(NodeState::Unusable)
    }

    /// Moves the node to `to` if the state machine allows it.
    ///
    /// Returns `false` for refused edges, including every edge out of a terminal state.
    pub(crate) fn transition(&self, to: NodeState) -> bool {
        let mut inner = self.inner.write();
        self.transition_locked(&mut inner, to)
    }

    fn transition_locked(&self, inner: &mut NodeInner, to: NodeState) -> bool {
        let from = inner.state;
        if from == to {
            return false;
        }
        if !from.can_transition_to(to) {
            tracing::debug!(
                node = %self.config.name,
                from = %from,
                to = %to,
                "refused state transition"
            );
            return false;
        }

        inner.state = to;
        inner.state_since = Utc::now();
        if !to.is_selectable() {
            inner.lagging_since = None;
            if inner.stale {
                inner.stale = false;
                self.metrics.set_stale(false);
            }
        }
        if to == NodeState::Unreachable {
            inner.consecutive_failures = 0;
        }
        self.metrics.record_transition(from, to);

        let node = self.config.name.as_str();
        let chain_id = self.expected_chain_id;
        match to {
            NodeState::Alive | NodeState::InSync => {
                tracing::info!(node = node, chain_id = chain_id, from = %from, to = %to, "node state changed");
            }
            NodeState::Dialed => {
                tracing::debug!(node = node, chain_id = chain_id, from = %from, to = %to, "node state changed");
            }
            NodeState::OutOfSync | NodeState::Unreachable | NodeState::Unusable => {
                tracing::warn!(node = node, chain_id = chain_id, from = %from, to = %to, "node state changed");
            }
            NodeState::InvalidChainId => {
                tracing::error!(node = node, chain_id = chain_id, from = %from, to = %to, "node state changed");
            }
        }
        true
    }

    /// Runs one dial attempt and moves the node to `Dialed` on success.
    pub(crate) async fn dial(&self) -> Result<(), DialError> {
        let result = self.dialer.attempt(self.transport.as_ref()).await;
        match &result {
            Err(DialError::InFlight) => {}
            Ok(()) => {
                self.metrics.record_dial(true);
                if !self.transition(NodeState::Dialed) {
                    // Marked unusable while dialing.
                    self.transport.close().await;
                }
            }
            Err(e) => {
                self.metrics.record_dial(false);
                tracing::warn!(
                    node = %self.config.name,
                    attempts = self.dialer.failed_attempts(),
                    error = %e,
                    "dial failed"
                );
            }
        }
        result
    }

    async fn query_chain_id(&self) -> Result<u64, TransportError> {
        tokio::time::timeout(self.call_timeout, self.transport.chain_id())
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    /// Verifies the endpoint's chain id after a dial.
    ///
    /// Returns `Ok(true)` and moves to `Alive` on a match, `Ok(false)` and moves to
    /// `InvalidChainId` on a mismatch. A query error counts as a consecutive failure and
    /// leaves the state unchanged.
    pub(crate) async fn verify_chain_id(&self) -> Result<bool, TransportError> {
        let reported = match self.query_chain_id().await {
            Ok(id) => id,
            Err(e) => {
                self.metrics.record_verify(false);
                let failures = self.record_failure();
                tracing::warn!(
                    node = %self.config.name,
                    failures = failures,
                    error = %e,
                    error_kind = e.as_metric_str(),
                    "chain id verification failed"
                );
                return Err(e);
            }
        };

        let matched = reported == self.expected_chain_id;
        self.metrics.record_verify(matched);

        let mut inner = self.inner.write();
        if matched {
            inner.chain_id.get_or_insert(reported);
            inner.consecutive_failures = 0;
            inner.last_head_advance = Some(Instant::now());
            inner.silence_reported = false;
            self.transition_locked(&mut inner, NodeState::Alive);
        } else {
            tracing::error!(
                node = %self.config.name,
                expected_chain_id = self.expected_chain_id,
                reported_chain_id = reported,
                "node serves a different chain than configured"
            );
            self.transition_locked(&mut inner, NodeState::InvalidChainId);
        }
        Ok(matched)
    }

    /// Re-queries the chain id of a node stuck in `InvalidChainId`, for diagnostics only.
    pub(crate) async fn recheck_chain_id(&self) -> Result<u64, TransportError> {
        let result = self.query_chain_id().await;
        self.metrics.record_verify(matches!(result, Ok(id) if id == self.expected_chain_id));
        result
    }

    fn record_failure(&self) -> u32 {
        let mut inner = self.inner.write();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.consecutive_failures
    }

    /// Records a head from a poll or a subscription. `highest_reported_block` only moves
    /// forward.
    pub(crate) fn observe_head(&self, head: Head) {
        let mut inner = self.inner.write();
        self.observe_head_locked(&mut inner, head);
    }

    fn observe_head_locked(&self, inner: &mut NodeInner, head: Head) {
        if head.number > inner.highest_reported_block {
            inner.highest_reported_block = head.number;
            inner.last_head_advance = Some(Instant::now());
            inner.silence_reported = false;
        } else {
            tracing::trace!(
                node = %self.config.name,
                block = head.number,
                highest = inner.highest_reported_block,
                "head does not advance highest block"
            );
        }
        self.metrics.record_seen_block(inner.highest_reported_block);
        inner.latest_head = Some(head);
    }

    pub(crate) fn record_poll_success(&self, head: Head, latency: Duration) {
        self.metrics.record_poll(true);
        let block_number = head.number;
        {
            let mut inner = self.inner.write();
            inner.consecutive_failures = 0;
            inner.last_poll_at = Some(Utc::now());
            inner.last_poll_success = Some(true);
            self.observe_head_locked(&mut inner, head);
        }
        self.push_poll_record(true, Some(block_number), latency, None);
    }

    /// Counts a failed poll and returns the consecutive failure count.
    ///
    /// Below `unreachable_threshold` the node's sync status becomes unknown, so an
    /// `InSync` or `OutOfSync` node falls back to `Alive`.
    pub(crate) fn record_poll_failure(
        &self,
        error: &TransportError,
        latency: Duration,
        unreachable_threshold: u32,
    ) -> u32 {
        self.metrics.record_poll(false);
        let failures = {
            let mut inner = self.inner.write();
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.last_poll_at = Some(Utc::now());
            inner.last_poll_success = Some(false);
            if inner.consecutive_failures < unreachable_threshold {
                self.transition_locked(&mut inner, NodeState::Alive);
            }
            inner.consecutive_failures
        };
        self.push_poll_record(false, None, latency, Some(error.to_string()));
        failures
    }

    /// Classifies the node against the pool's best head and updates the stale flag.
    ///
    /// The node is compared by `highest_reported_block`, never by its latest head, so a
    /// node that briefly serves an older head does not fall behind its own best block.
    ///
    /// The target is `OutOfSync` when either rule fires:
    /// - lag: `sync_threshold > 0` and `highest < best - sync_threshold`
    /// - silence: `no_new_heads_threshold > 0` and the highest block has not advanced for
    ///   that long, unless `live_peers` is zero; the last live node is kept in service
    ///
    /// Only applies while the node is selectable; returns the resulting state.
    pub(crate) fn update_sync_status(
        &self,
        best: u64,
        live_peers: usize,
        settings: &PoolSettings,
    ) -> NodeState {
        let mut inner = self.inner.write();
        if !inner.state.is_selectable() {
            return inner.state;
        }

        let highest = inner.highest_reported_block;
        let threshold = settings.sync_threshold;
        let lagging = threshold > 0 && highest < best.saturating_sub(threshold);

        if lagging {
            let since = *inner.lagging_since.get_or_insert_with(Instant::now);
            if !inner.stale && since.elapsed() > settings.very_old_head_threshold() {
                inner.stale = true;
                self.metrics.set_stale(true);
                tracing::warn!(
                    node = %self.config.name,
                    highest = highest,
                    best = best,
                    lagging_secs = since.elapsed().as_secs(),
                    "node head is very old"
                );
            }
        } else {
            inner.lagging_since = None;
            if inner.stale {
                inner.stale = false;
                self.metrics.set_stale(false);
                tracing::info!(node = %self.config.name, highest = highest, "node caught up");
            }
        }

        let silent = self.is_silent(&mut inner, live_peers, settings);
        let target = if lagging || silent { NodeState::OutOfSync } else { NodeState::InSync };
        self.transition_locked(&mut inner, target);
        inner.state
    }

    /// Applies the no-new-heads rule. Logs once per silence period.
    fn is_silent(&self, inner: &mut NodeInner, live_peers: usize, settings: &PoolSettings) -> bool {
        let limit = settings.no_new_heads_threshold();
        if limit.is_zero() {
            return false;
        }
        let Some(since) = inner.last_head_advance.map(|at| at.elapsed()) else {
            return false;
        };
        if since <= limit {
            return false;
        }

        if live_peers == 0 {
            if !inner.silence_reported {
                inner.silence_reported = true;
                tracing::warn!(
                    node = %self.config.name,
                    chain_id = self.expected_chain_id,
                    silent_secs = since.as_secs(),
                    "no new heads received, but this is the last live node; keeping it in service"
                );
            }
            return false;
        }

        if !inner.silence_reported {
            inner.silence_reported = true;
            tracing::warn!(
                node = %self.config.name,
                chain_id = self.expected_chain_id,
                silent_secs = since.as_secs(),
                live_peers = live_peers,
                "no new heads received, marking node out of sync"
            );
        }
        true
    }

    /// Drops the node to `Unreachable` and closes its transport.
    ///
    /// Returns `false` if the node was not in a connected state.
    pub(crate) async fn declare_unreachable(&self, reason: &str) -> bool {
        if !self.transition(NodeState::Unreachable) {
            return false;
        }
        tracing::warn!(node = %self.config.name, reason = reason, "node unreachable");
        self.transport.close().await;
        true
    }

    fn push_poll_record(
        &self,
        success: bool,
        block_number: Option<u64>,
        latency: Duration,
        error: Option<String>,
    ) {
        let mut history = self.poll_history.write();
        history.push_back(PollRecord {
            timestamp: Utc::now(),
            success,
            block_number,
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            error,
        });
        if history.len() > POLL_HISTORY_SIZE {
            history.pop_front();
        }
    }

    /// Returns recent poll outcomes, newest first.
    #[must_use]
    pub fn poll_history(&self, limit: usize) -> Vec<PollRecord> {
        self.poll_history.read().iter().rev().take(limit).cloned().collect()
    }

    #[must_use]
    pub fn status(&self) -> NodeStatus {
        let latency = self
            .latency
            .iter()
            .filter_map(|entry| entry.value().summary().map(|s| (entry.key().clone(), s)))
            .collect();

        let inner = self.inner.read();
        NodeStatus {
            name: self.config.name.clone(),
            order: self.config.order,
            state: inner.state,
            state_since: inner.state_since,
            chain_id: inner.chain_id,
            highest_reported_block: inner.highest_reported_block,
            latest_head: inner.latest_head.clone(),
            consecutive_failures: inner.consecutive_failures,
            last_poll_at: inner.last_poll_at,
            last_poll_success: inner.last_poll_success,
            stale: inner.stale,
            counters: self.metrics.snapshot(),
            latency,
        }
    }
}
