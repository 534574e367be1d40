//! Pure node ranking.
//!
//! Eligible nodes (`InSync`, `OutOfSync`, `Alive`) are always grouped by state rank first,
//! `InSync` > `OutOfSync` > `Alive`. The [`SelectionMode`] only decides the order inside a
//! rank group.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

use crate::node::NodeState;

/// Tie-break policy inside one state rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Lowest configured `order` first, then insertion order.
    #[default]
    PriorityLevel,
    /// Rotate through the group using the pool's rotation counter.
    RoundRobin,
    /// Highest reported block first, then priority.
    HighestHead,
}

/// Snapshot of one node as seen by the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Position of the node in the pool.
    pub index: usize,
    pub state: NodeState,
    pub order: u32,
    pub highest_block: u64,
}

/// Ranks eligible candidates best first and returns their `index` values.
///
/// Ineligible candidates are dropped. The result is deterministic for a given input and
/// `rotation`.
#[must_use]
pub fn rank(candidates: &[Candidate], mode: SelectionMode, rotation: usize) -> Vec<usize> {
    let mut eligible: Vec<&Candidate> =
        candidates.iter().filter(|c| c.state.is_selectable()).collect();

    match mode {
        SelectionMode::PriorityLevel | SelectionMode::RoundRobin => {
            eligible.sort_by_key(|c| (Reverse(c.state.rank()), c.order, c.index));
        }
        SelectionMode::HighestHead => {
            eligible.sort_by_key(|c| {
                (Reverse(c.state.rank()), Reverse(c.highest_block), c.order, c.index)
            });
        }
    }

    if mode == SelectionMode::RoundRobin {
        for group in eligible.chunk_by_mut(|a, b| a.state.rank() == b.state.rank()) {
            let len = group.len();
            group.rotate_left(rotation % len);
        }
    }

    eligible.into_iter().map(|c| c.index).collect()
}

/// Best eligible candidate, or `None` if there is none.
#[must_use]
pub fn select(candidates: &[Candidate], mode: SelectionMode, rotation: usize) -> Option<usize> {
    rank(candidates, mode, rotation).first().copied()
}
