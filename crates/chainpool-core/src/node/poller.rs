//! Per-node background task.
//!
//! The poller owns the node's state machine loop: dial while unreachable, verify the chain
//! id once dialed, poll heads while alive, and idle on diagnostics once the node serves the
//! wrong chain. Every wait observes the pool's shutdown signal. In-flight RPCs are not
//! aborted on shutdown; they are bounded by the call timeout instead.

use std::{future, sync::Arc, time::Duration, time::Instant};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use super::{DialError, Node, NodeState};
use crate::{
    config::PoolSettings,
    metrics::MetricsState,
    transport::TransportError,
    types::Head,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Shutdown,
}

pub(crate) struct Poller {
    node: Arc<Node>,
    peers: Arc<[Arc<Node>]>,
    settings: Arc<PoolSettings>,
    shutdown: broadcast::Receiver<()>,
}

impl Poller {
    /// `peers` is every node of the pool, `node` included; the pool-wide best head is taken
    /// over the selectable ones.
    pub(crate) fn new(
        node: Arc<Node>,
        peers: Arc<[Arc<Node>]>,
        settings: Arc<PoolSettings>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self { node, peers, settings, shutdown }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        debug!(node = %self.node.name(), "poller started");

        loop {
            let step = match self.node.state() {
                NodeState::Unreachable => self.dial().await,
                NodeState::Dialed => self.verify().await,
                NodeState::Alive | NodeState::InSync | NodeState::OutOfSync => {
                    self.poll_while_alive().await
                }
                NodeState::InvalidChainId => self.recheck_invalid_chain_id().await,
                NodeState::Unusable => {
                    self.node.transport().close().await;
                    info!(node = %self.node.name(), "node unusable, poller exiting");
                    Step::Shutdown
                }
            };
            if step == Step::Shutdown {
                break;
            }
        }

        debug!(node = %self.node.name(), "poller stopped");
    }

    async fn sleep_or_shutdown(&mut self, duration: Duration) -> Step {
        tokio::select! {
            () = tokio::time::sleep(duration) => Step::Continue,
            _ = self.shutdown.recv() => Step::Shutdown,
        }
    }

    async fn dial(&mut self) -> Step {
        match self.node.dial().await {
            Ok(()) => Step::Continue,
            Err(DialError::InFlight) => self.sleep_or_shutdown(self.settings.poll_interval()).await,
            Err(_) => {
                let delay = self.node.dialer().next_delay();
                debug!(
                    node = %self.node.name(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "waiting before next dial"
                );
                self.sleep_or_shutdown(delay).await
            }
        }
    }

    async fn verify(&mut self) -> Step {
        match self.node.verify_chain_id().await {
            Ok(_) => Step::Continue,
            Err(e) => {
                let failures = self.node.consecutive_failures();
                if e.is_connection_lost() || failures >= self.settings.unreachable_threshold {
                    self.node.declare_unreachable("chain id verification failed").await;
                    return Step::Continue;
                }
                let delay = self.node.dialer().policy().delay(failures.saturating_sub(1));
                self.sleep_or_shutdown(delay).await
            }
        }
    }

    async fn subscribe(&self) -> Result<Option<mpsc::Receiver<Head>>, TransportError> {
        if !self.settings.subscribe_new_heads {
            return Ok(None);
        }
        match self.node.transport().subscribe_new_heads().await {
            Ok(rx) => {
                debug!(node = %self.node.name(), "subscribed to new heads");
                Ok(Some(rx))
            }
            Err(TransportError::Unsupported) => {
                debug!(node = %self.node.name(), "transport has no head subscription, polling only");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn poll_while_alive(&mut self) -> Step {
        let mut heads = match self.subscribe().await {
            Ok(heads) => heads,
            Err(e) => {
                warn!(node = %self.node.name(), error = %e, "head subscription failed");
                self.node.declare_unreachable("head subscription failed").await;
                return Step::Continue;
            }
        };

        let mut ticker = interval(self.settings.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !self.node.state().is_selectable() {
                return Step::Continue;
            }

            tokio::select! {
                _ = self.shutdown.recv() => return Step::Shutdown,
                _ = ticker.tick() => self.poll_once().await,
                head = next_head(&mut heads) => match head {
                    Some(head) => {
                        self.node.observe_head(head);
                        self.refresh_sync_status();
                    }
                    None => {
                        self.node.declare_unreachable("head subscription closed").await;
                        return Step::Continue;
                    }
                },
            }
        }
    }

    async fn poll_once(&self) {
        let start = Instant::now();
        let result = tokio::time::timeout(
            self.settings.call_timeout(),
            self.node.transport().latest_head(),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout));
        let latency = start.elapsed();

        match result {
            Ok(head) => {
                tracing::trace!(node = %self.node.name(), block = head.number, "polled head");
                self.node.record_poll_success(head, latency);
                self.refresh_sync_status();
            }
            Err(e) => {
                let threshold = self.settings.unreachable_threshold;
                let failures = self.node.record_poll_failure(&e, latency, threshold);
                debug!(
                    node = %self.node.name(),
                    failures = failures,
                    threshold = threshold,
                    error = %e,
                    error_kind = e.as_metric_str(),
                    "poll failed"
                );
                if e.is_connection_lost() {
                    self.node.declare_unreachable("transport closed").await;
                } else if failures >= threshold {
                    self.node.declare_unreachable("too many consecutive poll failures").await;
                }
            }
        }
    }

    fn refresh_sync_status(&self) {
        let best = best_head(&self.peers);
        let live_peers = self
            .peers
            .iter()
            .filter(|peer| !Arc::ptr_eq(peer, &self.node) && peer.state().is_selectable())
            .count();
        self.node.update_sync_status(best, live_peers, &self.settings);
    }

    async fn recheck_invalid_chain_id(&mut self) -> Step {
        let interval = self.settings.invalid_chain_id_recheck_interval();
        if self.sleep_or_shutdown(interval).await == Step::Shutdown {
            return Step::Shutdown;
        }

        let expected = self.node.expected_chain_id();
        match self.node.recheck_chain_id().await {
            Ok(reported) if reported == expected => warn!(
                node = %self.node.name(),
                chain_id = reported,
                "node now reports the expected chain id but stays excluded until restart"
            ),
            Ok(reported) => debug!(
                node = %self.node.name(),
                expected_chain_id = expected,
                reported_chain_id = reported,
                "node still serves a different chain"
            ),
            Err(e) => debug!(node = %self.node.name(), error = %e, "chain id recheck failed"),
        }
        Step::Continue
    }
}

async fn next_head(heads: &mut Option<mpsc::Receiver<Head>>) -> Option<Head> {
    match heads {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}

/// Highest block reported by any selectable node.
pub(crate) fn best_head(nodes: &[Arc<Node>]) -> u64 {
    nodes
        .iter()
        .map(|n| n.selection_view())
        .filter(|v| v.state.is_selectable())
        .map(|v| v.highest_block)
        .max()
        .unwrap_or(0)
}
