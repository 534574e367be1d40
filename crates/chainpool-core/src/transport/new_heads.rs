//! `eth_subscribe("newHeads")` over a WebSocket.
//!
//! The subscription runs on its own connection next to the HTTP client: one task reads
//! notifications and forwards parsed heads into a channel. The channel closes when the
//! socket closes, errors, or the endpoint rejects the subscription.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use super::TransportError;
use crate::types::Head;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HEADS_BUFFER: usize = 64;

/// One message received on the subscription socket.
#[derive(Debug, PartialEq)]
pub(crate) enum Notification {
    /// Reply to `eth_subscribe` carrying the subscription id.
    Subscribed(String),
    NewHead(Head),
    /// Anything else, such as notifications for other subscriptions.
    Ignored,
}

/// Connects to `ws_url`, subscribes to new heads and spawns the forwarding task.
pub(crate) async fn subscribe(
    ws_url: &str,
) -> Result<(mpsc::Receiver<Head>, JoinHandle<()>), TransportError> {
    let (mut stream, response) = tokio_tungstenite::connect_async(ws_url).await.map_err(|e| {
        warn!(error = %e, "websocket connection failed");
        TransportError::ConnectionFailed(format!("websocket connection failed: {e}"))
    })?;
    debug!(status = response.status().as_u16(), "websocket connected");

    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "eth_subscribe",
        "params": ["newHeads"]
    });
    stream
        .send(Message::Text(request.to_string().into()))
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("websocket send error: {e}")))?;

    let (tx, rx) = mpsc::channel(HEADS_BUFFER);
    Ok((rx, tokio::spawn(forward_heads(stream, tx))))
}

async fn forward_heads(mut stream: WsStream, heads: mpsc::Sender<Head>) {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                warn!(frame = ?frame, "websocket closed by server");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "websocket error");
                break;
            }
        };

        match parse_notification(text.as_str()) {
            Ok(Notification::NewHead(head)) => {
                if heads.send(head).await.is_err() {
                    debug!("head receiver dropped, ending subscription");
                    break;
                }
            }
            Ok(Notification::Subscribed(id)) => {
                info!(subscription_id = %id, "new heads subscription confirmed");
            }
            Ok(Notification::Ignored) => trace!(message = text.as_str(), "ignored websocket message"),
            Err(TransportError::Rpc(code, message)) => {
                warn!(code = code, message = %message, "new heads subscription rejected");
                break;
            }
            Err(e) => warn!(error = %e, "unparseable websocket message"),
        }
    }

    if let Err(e) = stream.close(None).await {
        trace!(error = %e, "websocket close failed");
    }
}

/// Classifies one text frame of the subscription socket.
pub(crate) fn parse_notification(text: &str) -> Result<Notification, TransportError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| TransportError::InvalidResponse(format!("decode notification: {e}")))?;

    if let Some(error) = value.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
        let message = error.get("message").and_then(Value::as_str).unwrap_or_default();
        return Err(TransportError::Rpc(code, message.to_string()));
    }

    if let Some(id) = value.get("result").and_then(Value::as_str) {
        return Ok(Notification::Subscribed(id.to_string()));
    }

    if value.get("method").and_then(Value::as_str) != Some("eth_subscription") {
        return Ok(Notification::Ignored);
    }
    match value.get("params").and_then(|params| params.get("result")) {
        Some(block) => Head::from_block_json(block).map(Notification::NewHead),
        None => Ok(Notification::Ignored),
    }
}
