//! Sticky active node and its lease.
//!
//! Outside `RoundRobin`, the pool keeps serving the node it last chose while that node stays
//! eligible and no node of a better state rank exists. The lease task periodically moves
//! the pool onto the current best node even when the active one is still good enough, so a
//! recovered higher-priority node is picked up again.

use metrics::counter;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use super::{
    candidates,
    selector::{self, Candidate, SelectionMode},
};
use crate::{config::PoolSettings, node::Node};

/// Outcome of a sticky selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Choice {
    Kept(usize),
    Switched { from: Option<usize>, to: usize },
}

impl Choice {
    pub(crate) fn index(self) -> usize {
        match self {
            Self::Kept(index) | Self::Switched { to: index, .. } => index,
        }
    }
}

/// The pool's currently preferred node, by index.
#[derive(Debug, Default)]
pub(crate) struct ActiveNode {
    slot: Mutex<Option<usize>>,
    switches: AtomicU64,
}

impl ActiveNode {
    pub(crate) fn get(&self) -> Option<usize> {
        *self.slot.lock()
    }

    pub(crate) fn switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    /// Keeps the active node while it is eligible and not outranked by state; otherwise
    /// switches to the best candidate. `None` when nothing is eligible.
    pub(crate) fn choose(&self, candidates: &[Candidate], mode: SelectionMode) -> Option<Choice> {
        let best = selector::select(candidates, mode, 0)?;
        let mut slot = self.slot.lock();

        if let Some(current) = *slot {
            if current == best || outranks_or_ties(candidates, current, best) {
                return Some(Choice::Kept(current));
            }
        }
        Some(self.switch_locked(&mut slot, best))
    }

    /// Moves onto the best candidate unconditionally. `None` when nothing is eligible.
    pub(crate) fn renew(&self, candidates: &[Candidate], mode: SelectionMode) -> Option<Choice> {
        let best = selector::select(candidates, mode, 0)?;
        let mut slot = self.slot.lock();
        if *slot == Some(best) {
            return Some(Choice::Kept(best));
        }
        Some(self.switch_locked(&mut slot, best))
    }

    fn switch_locked(&self, slot: &mut Option<usize>, to: usize) -> Choice {
        let from = slot.replace(to);
        self.switches.fetch_add(1, Ordering::Relaxed);
        Choice::Switched { from, to }
    }
}

/// Whether `current` is still eligible and its state rank is at least `best`'s.
fn outranks_or_ties(candidates: &[Candidate], current: usize, best: usize) -> bool {
    let rank_of = |index: usize| {
        candidates
            .iter()
            .find(|c| c.index == index)
            .filter(|c| c.state.is_selectable())
            .map(|c| c.state.rank())
    };
    match (rank_of(current), rank_of(best)) {
        (Some(current), Some(best)) => current >= best,
        _ => false,
    }
}

/// Logs a switch and counts it against the new active node.
pub(crate) fn record_switch(chain_id: u64, nodes: &[Arc<Node>], choice: Choice, reason: &str) {
    let Choice::Switched { from, to } = choice else {
        return;
    };
    let to_name = nodes[to].name();
    let from_name = from.map(|index| nodes[index].name());

    counter!(
        "evm_pool_rpc_active_node_switches",
        "evmChainID" => chain_id.to_string(),
        "nodeName" => to_name.to_string()
    )
    .increment(1);

    match from_name {
        Some(from_name) => info!(
            chain_id = chain_id,
            from = from_name,
            to = to_name,
            reason = reason,
            "switching active node"
        ),
        None => debug!(chain_id = chain_id, to = to_name, "active node chosen"),
    }
}

/// Background task that renews the active node every `lease_duration`.
pub(crate) struct LeaseTask {
    chain_id: u64,
    nodes: Arc<[Arc<Node>]>,
    settings: Arc<PoolSettings>,
    active: Arc<ActiveNode>,
    shutdown: broadcast::Receiver<()>,
}

impl LeaseTask {
    pub(crate) fn new(
        chain_id: u64,
        nodes: Arc<[Arc<Node>]>,
        settings: Arc<PoolSettings>,
        active: Arc<ActiveNode>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self { chain_id, nodes, settings, active, shutdown }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let period = self.settings.lease_duration();
        info!(
            chain_id = self.chain_id,
            lease_ms = self.settings.lease_duration_ms,
            "best node lease started"
        );

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => break,
                _ = ticker.tick() => self.renew(),
            }
        }

        debug!(chain_id = self.chain_id, "best node lease stopped");
    }

    fn renew(&self) {
        let candidates = candidates(&self.nodes);
        match self.active.renew(&candidates, self.settings.selection_mode) {
            Some(choice) => record_switch(self.chain_id, &self.nodes, choice, "lease expired"),
            None => debug!(chain_id = self.chain_id, "lease expired with no live nodes"),
        }
    }
}
