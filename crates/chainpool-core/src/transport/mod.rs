//! Transport seam between the pool and concrete RPC clients.
//!
//! The pool, nodes and pollers depend only on the [`Transport`] trait. Concrete clients
//! implement it; [`HttpTransport`] is the one shipped with this crate, with optional
//! new-head subscriptions over a WebSocket.

pub mod errors;
pub mod http;
mod new_heads;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::types::{parse_hex_u64, Head};

pub use errors::TransportError;
pub use http::{HttpTransport, HttpTransportConfig};

/// Connection to a single remote JSON-RPC endpoint.
///
/// Implementations must be cheap to share behind an `Arc` and safe to call from the node's
/// poller task and from callers of [`Node::call`](crate::node::Node::call) concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes (or re-establishes) the connection.
    async fn dial(&self) -> Result<(), TransportError>;

    /// Issues a single JSON-RPC call and returns its `result` member.
    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError>;

    /// Subscribes to new block headers.
    ///
    /// The returned channel closing means the subscription was lost. Transports without
    /// push support keep the default, which returns [`TransportError::Unsupported`].
    async fn subscribe_new_heads(&self) -> Result<mpsc::Receiver<Head>, TransportError> {
        Err(TransportError::Unsupported)
    }

    /// Releases the connection. Further calls fail until the next [`dial`](Self::dial).
    async fn close(&self);

    /// Queries the chain id served by the endpoint.
    async fn chain_id(&self) -> Result<u64, TransportError> {
        let result = self.call("eth_chainId", json!([])).await?;
        parse_hex_u64(&result)
    }

    /// Fetches the latest block header.
    async fn latest_head(&self) -> Result<Head, TransportError> {
        let result = self.call("eth_getBlockByNumber", json!(["latest", false])).await?;
        Head::from_block_json(&result)
    }
}
