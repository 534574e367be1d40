use thiserror::Error;

/// Errors returned by [`Pool`](super::Pool) and [`PoolBuilder`](super::PoolBuilder).
///
/// Only [`PoolError::NoLiveNodes`] occurs at runtime; the rest are construction, lifecycle
/// or operator errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolError {
    /// No node is currently eligible for selection.
    #[error("no live nodes available for chain {chain_id}")]
    NoLiveNodes { chain_id: u64 },

    #[error("no nodes configured for chain {chain_id}")]
    NoNodesConfigured { chain_id: u64 },

    #[error("duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("pool already started")]
    AlreadyStarted,

    #[error("pool stopped")]
    Stopped,

    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// The node is already `InvalidChainId` or `Unusable`.
    #[error("node {0} is in a terminal state")]
    NodeTerminal(String),
}
