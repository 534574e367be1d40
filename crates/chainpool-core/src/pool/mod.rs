//! Single-chain node pool.
//!
//! The pool owns its nodes, their poller tasks and, when a lease is configured, the lease
//! task. Selection reads per-node snapshots synchronously, one node lock at a time.

pub mod builder;
pub mod errors;
mod lease;
pub mod selector;

use futures::future::join_all;
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use self::lease::{record_switch, ActiveNode, LeaseTask};
use crate::{
    config::PoolSettings,
    node::{
        poller::{best_head, Poller},
        Node, NodeState, NodeStatus,
    },
};

pub use builder::PoolBuilder;
pub use errors::PoolError;
pub use selector::{Candidate, SelectionMode};

enum Lifecycle {
    Idle,
    Running { shutdown_tx: broadcast::Sender<()>, tasks: Vec<JoinHandle<()>> },
    Stopped,
}

/// The nodes serving one chain, plus selection.
pub struct Pool {
    chain_id: u64,
    nodes: Arc<[Arc<Node>]>,
    settings: Arc<PoolSettings>,
    /// Round-robin pointer, advanced on every selection in `RoundRobin` mode.
    rotation: AtomicUsize,
    /// Sticky choice used by every mode except `RoundRobin`.
    active: Arc<ActiveNode>,
    lifecycle: Mutex<Lifecycle>,
}

impl Pool {
    pub(crate) fn new(chain_id: u64, nodes: Arc<[Arc<Node>]>, settings: Arc<PoolSettings>) -> Self {
        Self {
            chain_id,
            nodes,
            settings,
            rotation: AtomicUsize::new(0),
            active: Arc::new(ActiveNode::default()),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    #[must_use]
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    #[must_use]
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running { .. })
    }

    /// Spawns one poller task per node that is not `Unusable`, plus the lease task when
    /// [`PoolSettings::lease_enabled`].
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`PoolError::AlreadyStarted`] if the pool is running
    /// - [`PoolError::Stopped`] after [`Pool::stop`]
    pub fn start(&self) -> Result<(), PoolError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running { .. } => return Err(PoolError::AlreadyStarted),
            Lifecycle::Stopped => return Err(PoolError::Stopped),
            Lifecycle::Idle => {}
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks: Vec<JoinHandle<()>> = self
            .nodes
            .iter()
            .filter(|node| node.state() != NodeState::Unusable)
            .map(|node| {
                Poller::new(
                    Arc::clone(node),
                    Arc::clone(&self.nodes),
                    Arc::clone(&self.settings),
                    shutdown_tx.subscribe(),
                )
                .spawn()
            })
            .collect();
        let pollers = tasks.len();

        if self.settings.lease_enabled() {
            tasks.push(
                LeaseTask::new(
                    self.chain_id,
                    Arc::clone(&self.nodes),
                    Arc::clone(&self.settings),
                    Arc::clone(&self.active),
                    shutdown_tx.subscribe(),
                )
                .spawn(),
            );
        } else if self.settings.selection_mode == SelectionMode::RoundRobin {
            info!(chain_id = self.chain_id, "round robin selection, best node switching is disabled");
        }

        info!(
            chain_id = self.chain_id,
            nodes = self.nodes.len(),
            pollers = pollers,
            selection_mode = ?self.settings.selection_mode,
            lease_ms = self.settings.lease_duration_ms,
            "pool started"
        );
        *lifecycle = Lifecycle::Running { shutdown_tx, tasks };
        Ok(())
    }

    /// Signals every pool task to stop, waits for all of them, then closes every transport.
    ///
    /// Calling `stop` again is a no-op.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);

        match previous {
            Lifecycle::Stopped => {
                warn!(chain_id = self.chain_id, "pool already stopped");
                return;
            }
            Lifecycle::Idle => {
                debug!(chain_id = self.chain_id, "stopping pool that was never started");
            }
            Lifecycle::Running { shutdown_tx, tasks } => {
                info!(chain_id = self.chain_id, "stopping pool");
                if let Err(e) = shutdown_tx.send(()) {
                    debug!(error = %e, "no pollers left to signal");
                }
                for result in join_all(tasks).await {
                    if let Err(e) = result {
                        warn!(chain_id = self.chain_id, error = %e, "pool task failed");
                    }
                }
            }
        }

        join_all(self.nodes.iter().map(|node| node.transport().close())).await;
        info!(chain_id = self.chain_id, "pool stopped");
    }

    /// Returns a node to send the next request to. Never awaits.
    ///
    /// In `RoundRobin` mode every call rotates through the best rank group. In the other
    /// modes the pool keeps returning its active node while that node is eligible and no
    /// node of a better state rank exists; otherwise it switches to the best node.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NoLiveNodes`] if no node is `InSync`, `OutOfSync` or `Alive`.
    pub fn select_node(&self) -> Result<Arc<Node>, PoolError> {
        let candidates = candidates(&self.nodes);
        let mode = self.settings.selection_mode;

        let selected = match mode {
            SelectionMode::RoundRobin => {
                let rotation = self.rotation.fetch_add(1, Ordering::Relaxed);
                selector::select(&candidates, mode, rotation)
            }
            SelectionMode::PriorityLevel | SelectionMode::HighestHead => {
                self.active.choose(&candidates, mode).map(|choice| {
                    record_switch(self.chain_id, &self.nodes, choice, "active node outranked");
                    choice.index()
                })
            }
        };

        match selected {
            Some(index) => Ok(Arc::clone(&self.nodes[index])),
            None => {
                warn!(chain_id = self.chain_id, "no live nodes available");
                Err(PoolError::NoLiveNodes { chain_id: self.chain_id })
            }
        }
    }

    /// The node [`Pool::select_node`] last settled on, outside `RoundRobin` mode.
    #[must_use]
    pub fn active_node(&self) -> Option<Arc<Node>> {
        self.active.get().map(|index| Arc::clone(&self.nodes[index]))
    }

    /// How many times the active node changed, by selection or by lease.
    #[must_use]
    pub fn active_node_switches(&self) -> u64 {
        self.active.switches()
    }

    /// All eligible nodes, best first, without advancing the round-robin pointer.
    #[must_use]
    pub fn ranked_nodes(&self) -> Vec<Arc<Node>> {
        let rotation = self.rotation.load(Ordering::Relaxed);
        selector::rank(&candidates(&self.nodes), self.settings.selection_mode, rotation)
            .into_iter()
            .map(|index| Arc::clone(&self.nodes[index]))
            .collect()
    }

    /// Status snapshot of every node, in pool order.
    #[must_use]
    pub fn nodes(&self) -> Vec<NodeStatus> {
        self.nodes.iter().map(|node| node.status()).collect()
    }

    #[must_use]
    pub fn node_states(&self) -> BTreeMap<String, NodeState> {
        self.nodes.iter().map(|node| (node.name().to_string(), node.state())).collect()
    }

    /// Number of eligible nodes and the highest block any of them reported.
    #[must_use]
    pub fn live_summary(&self) -> (usize, u64) {
        let live = self.nodes.iter().filter(|node| node.state().is_selectable()).count();
        (live, best_head(&self.nodes))
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.iter().find(|node| node.name() == name).cloned()
    }

    /// Operator action: permanently removes a node from service.
    ///
    /// # Errors
    ///
    /// - [`PoolError::UnknownNode`] if no node has that name
    /// - [`PoolError::NodeTerminal`] if the node is already `InvalidChainId` or `Unusable`
    pub fn mark_unusable(&self, name: &str) -> Result<(), PoolError> {
        let node = self.node(name).ok_or_else(|| PoolError::UnknownNode(name.to_string()))?;
        if node.mark_unusable() {
            info!(chain_id = self.chain_id, node = name, "node marked unusable by operator");
            Ok(())
        } else {
            Err(PoolError::NodeTerminal(name.to_string()))
        }
    }
}

/// Selector input for every node, in pool order.
pub(crate) fn candidates(nodes: &[Arc<Node>]) -> Vec<Candidate> {
    nodes
        .iter()
        .enumerate()
        .map(|(index, node)| {
            let view = node.selection_view();
            Candidate {
                index,
                state: view.state,
                order: node.config().order,
                highest_block: view.highest_block,
            }
        })
        .collect()
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("chain_id", &self.chain_id)
            .field("nodes", &self.nodes)
            .field("selection_mode", &self.settings.selection_mode)
            .finish_non_exhaustive()
    }
}
