//! Scriptable in-memory [`Transport`].
//!
//! Every knob can be flipped while a pool is running; the node's poller picks the change up
//! on its next dial or poll.

use async_trait::async_trait;
use chainpool_core::{types::Head, Transport, TransportError};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::mpsc;

#[derive(Debug)]
struct MockState {
    dial_ok: bool,
    chain_id: u64,
    head: u64,
    fail_heads: bool,
    closed: bool,
    subscriptions: bool,
    heads_tx: Option<mpsc::Sender<Head>>,
}

/// In-memory transport whose behavior tests change at runtime.
#[derive(Debug)]
pub struct MockTransport {
    state: Mutex<MockState>,
    dials: AtomicUsize,
    closes: AtomicUsize,
    head_polls: AtomicUsize,
}

impl MockTransport {
    /// Creates a transport that dials fine, reports `chain_id` and serves head `head`.
    #[must_use]
    pub fn new(chain_id: u64, head: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                dial_ok: true,
                chain_id,
                head,
                fail_heads: false,
                closed: true,
                subscriptions: false,
                heads_tx: None,
            }),
            dials: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            head_polls: AtomicUsize::new(0),
        })
    }

    /// Enables `subscribe_new_heads`; heads are then pushed with [`MockTransport::push_head`].
    #[must_use]
    pub fn with_subscriptions(self: Arc<Self>) -> Arc<Self> {
        self.state.lock().subscriptions = true;
        self
    }

    pub fn set_dial_ok(&self, ok: bool) {
        self.state.lock().dial_ok = ok;
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().head = head;
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.state.lock().chain_id = chain_id;
    }

    /// While set, every head poll times out.
    pub fn set_fail_heads(&self, fail: bool) {
        self.state.lock().fail_heads = fail;
    }

    /// Pushes a head to the live subscription. Returns `false` without one.
    pub async fn push_head(&self, number: u64) -> bool {
        let tx = self.state.lock().heads_tx.clone();
        match tx {
            Some(tx) => tx.send(Head::new(number, number)).await.is_ok(),
            None => false,
        }
    }

    /// Drops the subscription sender, which closes the node's head channel.
    pub fn drop_subscription(&self) {
        self.state.lock().heads_tx = None;
    }

    #[must_use]
    pub fn has_subscription(&self) -> bool {
        self.state.lock().heads_tx.is_some()
    }

    #[must_use]
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn head_poll_count(&self) -> usize {
        self.head_polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn dial(&self) -> Result<(), TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.dial_ok {
            state.closed = false;
            Ok(())
        } else {
            Err(TransportError::ConnectionFailed("connection refused".to_string()))
        }
    }

    async fn call(&self, method: &str, _params: Value) -> Result<Value, TransportError> {
        let state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }

        match method {
            "eth_chainId" => Ok(json!(format!("{:#x}", state.chain_id))),
            "eth_blockNumber" => Ok(json!(format!("{:#x}", state.head))),
            "eth_getBlockByNumber" => {
                self.head_polls.fetch_add(1, Ordering::SeqCst);
                if state.fail_heads {
                    Err(TransportError::Timeout)
                } else {
                    Ok(json!({
                        "number": format!("{:#x}", state.head),
                        "timestamp": format!("{:#x}", state.head),
                        "hash": format!("0x{:064x}", state.head),
                    }))
                }
            }
            other => Err(TransportError::Rpc(-32601, format!("method {other} not found"))),
        }
    }

    async fn subscribe_new_heads(&self) -> Result<mpsc::Receiver<Head>, TransportError> {
        let mut state = self.state.lock();
        if !state.subscriptions {
            return Err(TransportError::Unsupported);
        }
        if state.closed {
            return Err(TransportError::Closed);
        }
        let (tx, rx) = mpsc::channel(16);
        state.heads_tx = Some(tx);
        Ok(rx)
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.closed = true;
        state.heads_tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_requires_dial() {
        let transport = MockTransport::new(1, 42);
        assert!(matches!(transport.chain_id().await, Err(TransportError::Closed)));

        transport.dial().await.unwrap();
        assert_eq!(transport.chain_id().await.unwrap(), 1);
        assert_eq!(transport.latest_head().await.unwrap().number, 42);

        transport.close().await;
        assert!(matches!(transport.latest_head().await, Err(TransportError::Closed)));
        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_transport_subscription() {
        let transport = MockTransport::new(1, 1).with_subscriptions();
        transport.dial().await.unwrap();
        let mut rx = transport.subscribe_new_heads().await.unwrap();

        assert!(transport.push_head(7).await);
        assert_eq!(rx.recv().await.map(|h| h.number), Some(7));

        transport.drop_subscription();
        assert!(rx.recv().await.is_none());
    }
}
