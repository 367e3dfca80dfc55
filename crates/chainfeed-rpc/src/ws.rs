//! WebSocket JSON-RPC transport with auto-reconnect.
//!
//! A background task owns the socket. Callers correlate requests to
//! responses through a pending map keyed by request id; new-head
//! subscriptions are re-established transparently after a reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse, RpcId};
use crate::transport::RpcTransport;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<JsonRpcResponse, TransportError>>>>>;

/// Configuration for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Reconnect backoff starting duration.
    pub reconnect_initial: Duration,
    /// Maximum reconnect backoff.
    pub reconnect_max: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(60),
        }
    }
}

/// Command sent from callers to the background task.
enum WsCommand {
    Send {
        req: JsonRpcRequest,
        tx: oneshot::Sender<Result<JsonRpcResponse, TransportError>>,
    },
    SubscribeNewHeads {
        tx: mpsc::UnboundedSender<Value>,
    },
    Close,
}

/// WebSocket JSON-RPC transport.
pub struct WsTransport {
    url: String,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
}

impl WsTransport {
    /// Start the background task for `url`. The connection itself is
    /// established (and re-established) lazily inside the task.
    pub fn connect(url: impl Into<String>, config: WsConfig) -> Self {
        let url = url.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<WsCommand>();
        let task_url = url.clone();
        tokio::spawn(async move {
            ws_task(task_url, cmd_rx, config).await;
        });
        Self { url, cmd_tx }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WsCommand::Close);
    }
}

#[async_trait]
impl RpcTransport for WsTransport {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Send { req, tx })
            .map_err(|_| TransportError::Closed(self.url.clone()))?;
        rx.await
            .map_err(|_| TransportError::WebSocket("response dropped".into()))?
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn supports_subscriptions(&self) -> bool {
        true
    }

    async fn subscribe_new_heads(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<Value>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.cmd_tx
            .send(WsCommand::SubscribeNewHeads { tx })
            .map_err(|_| TransportError::Closed(self.url.clone()))?;
        Ok(rx)
    }
}

/// Background task that owns the WebSocket connection.
async fn ws_task(url: String, mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>, config: WsConfig) {
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    // Fan-out list for newHeads notifications; survives reconnects.
    let mut head_subscribers: Vec<mpsc::UnboundedSender<Value>> = Vec::new();
    // Subscription id currently assigned by the node, if any.
    let mut head_sub_id: Option<String> = None;
    let mut backoff = config.reconnect_initial;
    let mut next_internal_id: u64 = u64::MAX / 2;

    loop {
        tracing::info!(url = %url, "connecting via WebSocket");

        match tokio_tungstenite::connect_async(&url).await {
            Err(e) => {
                tracing::warn!(error = %e, url = %url, "WS connect failed, retrying in {backoff:?}");
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.reconnect_max);
            }
            Ok((ws_stream, _)) => {
                backoff = config.reconnect_initial;
                let (mut sink, mut stream) = ws_stream.split();

                // (Re-)establish the newHeads subscription if anyone listens.
                head_sub_id = None;
                if !head_subscribers.is_empty() {
                    next_internal_id += 1;
                    let req = JsonRpcRequest::new(
                        next_internal_id,
                        "eth_subscribe",
                        json!(["newHeads"]),
                    );
                    if let Ok(msg) = serde_json::to_string(&req) {
                        let _ = sink.send(Message::Text(msg.into())).await;
                    }
                }

                loop {
                    tokio::select! {
                        cmd = cmd_rx.recv() => {
                            match cmd {
                                None | Some(WsCommand::Close) => return,
                                Some(WsCommand::Send { req, tx }) => {
                                    let id = match &req.id { RpcId::Number(n) => *n, _ => 0 };
                                    pending.lock().unwrap().insert(id, tx);
                                    match serde_json::to_string(&req) {
                                        Ok(msg) => {
                                            if sink.send(Message::Text(msg.into())).await.is_err() {
                                                fail_pending(&pending, "connection dropped");
                                                break;
                                            }
                                        }
                                        Err(e) => {
                                            if let Some(tx) = pending.lock().unwrap().remove(&id) {
                                                let _ = tx.send(Err(TransportError::Deserialization(e)));
                                            }
                                        }
                                    }
                                }
                                Some(WsCommand::SubscribeNewHeads { tx }) => {
                                    head_subscribers.push(tx);
                                    if head_sub_id.is_none() {
                                        next_internal_id += 1;
                                        let req = JsonRpcRequest::new(
                                            next_internal_id,
                                            "eth_subscribe",
                                            json!(["newHeads"]),
                                        );
                                        if let Ok(msg) = serde_json::to_string(&req) {
                                            if sink.send(Message::Text(msg.into())).await.is_err() {
                                                fail_pending(&pending, "connection dropped");
                                                break;
                                            }
                                        }
                                    }
                                }
                            }
                        }
                        msg = stream.next() => {
                            match msg {
                                None => {
                                    fail_pending(&pending, "stream closed");
                                    break;
                                }
                                Some(Err(e)) => {
                                    tracing::warn!(error = %e, "WS receive error");
                                    fail_pending(&pending, "receive error");
                                    break;
                                }
                                Some(Ok(Message::Text(text))) => {
                                    handle_message(
                                        text.as_str(),
                                        &pending,
                                        &mut head_sub_id,
                                        &mut head_subscribers,
                                    );
                                }
                                Some(Ok(Message::Close(_))) => {
                                    fail_pending(&pending, "server closed");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                }

                tracing::warn!(url = %url, "WS disconnected, reconnecting in {backoff:?}");
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.reconnect_max);
            }
        }
    }
}

/// Fail every in-flight request; the gateway's retry policy takes it
/// from there.
fn fail_pending(pending: &PendingMap, reason: &str) {
    for (_, tx) in pending.lock().unwrap().drain() {
        let _ = tx.send(Err(TransportError::WebSocket(reason.into())));
    }
}

fn handle_message(
    text: &str,
    pending: &PendingMap,
    head_sub_id: &mut Option<String>,
    head_subscribers: &mut Vec<mpsc::UnboundedSender<Value>>,
) {
    let Ok(val) = serde_json::from_str::<Value>(text) else {
        tracing::debug!("failed to parse WS message as JSON");
        return;
    };

    // Subscription notification?
    if val.get("method").and_then(|m| m.as_str()) == Some("eth_subscription") {
        if let Some(params) = val.get("params") {
            let matches = params["subscription"]
                .as_str()
                .zip(head_sub_id.as_deref())
                .is_some_and(|(got, want)| got == want);
            if matches {
                let head = params["result"].clone();
                head_subscribers.retain(|tx| tx.send(head.clone()).is_ok());
            }
        }
        return;
    }

    // Regular JSON-RPC response.
    if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(text) {
        let id = match &resp.id {
            RpcId::Number(n) => *n,
            _ => return,
        };
        // Internal subscribe call? Record the assigned subscription id.
        if id >= u64::MAX / 2 {
            if let Some(sub) = resp.result.as_ref().and_then(|r| r.as_str()) {
                *head_sub_id = Some(sub.to_string());
            }
            return;
        }
        if let Some(tx) = pending.lock().unwrap().remove(&id) {
            let _ = tx.send(Ok(resp));
        }
    }
}
