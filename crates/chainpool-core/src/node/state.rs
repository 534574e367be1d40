use serde::{Deserialize, Serialize};
use std::fmt;

/// Health state of a single node.
///
/// Transitions:
/// - `Unreachable` -> `Dialed`: transport dial succeeded
/// - `Dialed` -> `Alive`: reported chain id matches the pool's
/// - `Dialed` -> `InvalidChainId`: reported chain id differs from the pool's
/// - `Alive` / `InSync` / `OutOfSync` -> each other: sync status from each poll
/// - `Dialed` / `Alive` / `InSync` / `OutOfSync` -> `Unreachable`: transport IO error or
///   consecutive failures reaching the unreachable threshold
/// - any non-terminal -> `Unusable`: configuration or operator action only
///
/// `InvalidChainId` and `Unusable` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// No usable connection. The dialer is retrying with backoff.
    Unreachable,
    /// Connected, chain id not yet verified.
    Dialed,
    /// Serves a different chain than the pool. Terminal.
    InvalidChainId,
    /// Verified and polling, sync status unknown.
    Alive,
    /// Verified, but its head lags the pool's best head beyond the sync threshold.
    OutOfSync,
    /// Verified and within the sync threshold of the pool's best head.
    InSync,
    /// Removed from service by configuration or operator. Terminal.
    Unusable,
}

impl NodeState {
    pub const ALL: [Self; 7] = [
        Self::Unreachable,
        Self::Dialed,
        Self::InvalidChainId,
        Self::Alive,
        Self::OutOfSync,
        Self::InSync,
        Self::Unusable,
    ];

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::InvalidChainId | Self::Unusable)
    }

    /// Connected states can drop to `Unreachable` on IO failure.
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Dialed | Self::Alive | Self::OutOfSync | Self::InSync)
    }

    /// States the selector may hand out to callers.
    #[must_use]
    pub fn is_selectable(self) -> bool {
        matches!(self, Self::Alive | Self::OutOfSync | Self::InSync)
    }

    /// Selection rank: `InSync` > `OutOfSync` > `Alive`. Non-selectable states rank 0.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::InSync => 3,
            Self::OutOfSync => 2,
            Self::Alive => 1,
            _ => 0,
        }
    }

    /// Returns `true` if the state machine permits moving from `self` to `to`.
    ///
    /// Self-transitions are not edges; callers treat them as no-ops.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        if self == to || self.is_terminal() {
            return false;
        }
        match (self, to) {
            (_, Self::Unusable) => true,
            (Self::Unreachable, Self::Dialed) => true,
            (Self::Dialed, Self::Alive | Self::InvalidChainId | Self::Unreachable) => true,
            (
                Self::Alive | Self::InSync | Self::OutOfSync,
                Self::Alive | Self::InSync | Self::OutOfSync | Self::Unreachable,
            ) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unreachable => "unreachable",
            Self::Dialed => "dialed",
            Self::InvalidChainId => "invalid_chain_id",
            Self::Alive => "alive",
            Self::OutOfSync => "out_of_sync",
            Self::InSync => "in_sync",
            Self::Unusable => "unusable",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
