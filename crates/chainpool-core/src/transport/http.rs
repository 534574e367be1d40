use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};

use super::{new_heads, Transport, TransportError};
use crate::types::Head;

/// Configuration for the HTTP JSON-RPC client.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Whole-request timeout, applied on top of the caller's own timeout
    pub request_timeout: Duration,
    /// Idle pooled connections are dropped after this long
    pub pool_idle_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            pool_idle_timeout: Duration::from_secs(30),
            user_agent: concat!("chainpool/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<JsonRpcErrorObject>,
}

#[derive(Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    #[serde(default)]
    message: String,
}

/// [`Transport`] over HTTP JSON-RPC.
///
/// HTTP is connectionless, so `dial` is a reachability check (`web3_clientVersion`) and
/// `close` flips a flag that makes further calls fail with [`TransportError::Closed`]
/// until the next successful dial.
///
/// With a WebSocket URL configured, new-head subscriptions run over a separate socket;
/// `close` tears that socket down. Without one they are unsupported.
pub struct HttpTransport {
    url: String,
    ws_url: Option<String>,
    client: Client,
    next_id: AtomicU64,
    closed: AtomicBool,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

impl HttpTransport {
    /// Creates a transport for `url` with default client settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        Self::with_config(url, &HttpTransportConfig::default())
    }

    /// Creates a transport for `url` with the provided client configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying reqwest client fails to build.
    pub fn with_config(
        url: impl Into<String>,
        config: &HttpTransportConfig,
    ) -> Result<Self, TransportError> {
        let client = ClientBuilder::new()
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(4)
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(config.user_agent.clone())
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build http client");
                TransportError::ConnectionFailed(format!("HTTP client build failed: {e}"))
            })?;

        Ok(Self {
            url: url.into(),
            ws_url: None,
            client,
            next_id: AtomicU64::new(1),
            // Starts closed: nothing may be called before the first dial.
            closed: AtomicBool::new(true),
            subscription: Mutex::new(None),
        })
    }

    /// Sets the WebSocket endpoint used for new-head subscriptions.
    #[must_use]
    pub fn with_ws_url(mut self, ws_url: Option<String>) -> Self {
        self.ws_url = ws_url;
        self
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn ws_url(&self) -> Option<&str> {
        self.ws_url.as_deref()
    }

    fn abort_subscription(&self) {
        if let Some(task) = self.subscription.lock().take() {
            task.abort();
        }
    }

    /// Maps reqwest failures to messages that never echo the endpoint URL, which often
    /// carries an API key.
    fn sanitize_network_error(error: &reqwest::Error) -> String {
        if error.is_connect() {
            "connection refused or unreachable".to_string()
        } else if error.is_request() {
            "request failed".to_string()
        } else if error.is_body() {
            "response body error".to_string()
        } else if error.is_decode() {
            "response decode error".to_string()
        } else if error.is_redirect() {
            "unexpected redirect".to_string()
        } else {
            "network error".to_string()
        }
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let body = bytes::Bytes::from(
            serde_json::to_vec(&request)
                .map_err(|e| TransportError::InvalidResponse(format!("encode request: {e}")))?,
        );

        let response = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::ConnectionFailed(Self::sanitize_network_error(&e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::trace!(status = status.as_u16(), method = method, "http request failed");
            return Err(TransportError::ConnectionFailed(format!("http status {}", status.as_u16())));
        }

        let bytes = response.bytes().await?;
        let decoded: JsonRpcResponse = serde_json::from_slice(&bytes)
            .map_err(|e| TransportError::InvalidResponse(format!("decode response: {e}")))?;

        match decoded.error {
            Some(err) => Err(TransportError::Rpc(err.code, err.message)),
            None => Ok(decoded.result),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn dial(&self) -> Result<(), TransportError> {
        self.send("web3_clientVersion", json!([])).await?;
        self.closed.store(false, Ordering::Release);
        Ok(())
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.send(method, params).await
    }

    async fn subscribe_new_heads(&self) -> Result<mpsc::Receiver<Head>, TransportError> {
        let Some(ws_url) = self.ws_url.as_deref() else {
            return Err(TransportError::Unsupported);
        };
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let (heads, task) = new_heads::subscribe(ws_url).await?;
        if let Some(previous) = self.subscription.lock().replace(task) {
            previous.abort();
        }
        Ok(heads)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.abort_subscription();
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.abort_subscription();
    }
}
