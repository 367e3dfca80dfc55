//! The `RpcTransport` trait — the abstraction all transports implement.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// The central async trait every RPC transport must implement.
///
/// # Object Safety
/// The trait is object-safe and stored as `Arc<dyn RpcTransport>` by the
/// gateway and the fallback transport.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the response.
    ///
    /// Implementations send exactly once; retry policy belongs to the
    /// gateway so it applies uniformly across transports.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// The transport's identifier (URL or name), for logs.
    fn url(&self) -> &str;

    /// Returns `true` if `subscribe_new_heads` is available.
    fn supports_subscriptions(&self) -> bool {
        false
    }

    /// Subscribe to new-head notifications (`eth_subscribe("newHeads")`).
    ///
    /// Only WebSocket transports implement this; the live follower falls
    /// back to polling otherwise.
    async fn subscribe_new_heads(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<Value>, TransportError> {
        Err(TransportError::SubscriptionsUnsupported(
            self.url().to_string(),
        ))
    }
}
