use thiserror::Error;

/// Errors surfaced by a [`Transport`](super::Transport).
///
/// From the pool's point of view every variant is transient: it counts toward the node's
/// consecutive failure budget, never toward a terminal state.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// Request exceeded its timeout.
    #[error("request timeout")]
    Timeout,

    /// Failed to reach the endpoint.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// JSON-RPC error object returned by the endpoint.
    ///
    /// First field is the RPC error code, second is the error message.
    #[error("rpc error {0}: {1}")]
    Rpc(i64, String),

    /// Response could not be parsed or was missing required fields.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The transport does not implement the requested capability.
    #[error("operation not supported by transport")]
    Unsupported,

    /// The transport has been closed and must be dialed again.
    #[error("transport closed")]
    Closed,

    /// Network-level error from the underlying HTTP client.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl TransportError {
    /// Returns `true` if the transport reports its connection as gone, rather than a single
    /// request having failed. The poller treats this as an immediate IO failure.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
