//! Prioritized fallback across multiple transports.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::RpcTransport;

/// Tries transports strictly in configuration order; each subsequent
/// transport is attempted only on a transport-level failure of the one
/// before it. Application errors (the node answered) return immediately.
pub struct FallbackTransport {
    transports: Vec<Arc<dyn RpcTransport>>,
}

impl FallbackTransport {
    pub fn new(transports: Vec<Arc<dyn RpcTransport>>) -> Self {
        Self { transports }
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

#[async_trait]
impl RpcTransport for FallbackTransport {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let mut last_error = String::from("no transports configured");

        for transport in &self.transports {
            match transport.send(req.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        url = %transport.url(),
                        error = %e,
                        "transport failed, trying next fallback"
                    );
                    last_error = format!("{}: {e}", transport.url());
                }
                // Application-level: the node answered; don't mask it by
                // asking a different node.
                Err(e) => return Err(e),
            }
        }

        Err(TransportError::AllTransportsFailed(last_error))
    }

    fn url(&self) -> &str {
        "fallback"
    }

    fn supports_subscriptions(&self) -> bool {
        self.transports
            .first()
            .is_some_and(|t| t.supports_subscriptions())
    }

    /// Subscriptions bind to the primary transport only; a fallback chain
    /// mid-subscription would silently change the block stream.
    async fn subscribe_new_heads(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<Value>, TransportError> {
        match self.transports.first() {
            Some(primary) if primary.supports_subscriptions() => {
                primary.subscribe_new_heads().await
            }
            _ => Err(TransportError::SubscriptionsUnsupported("fallback".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{JsonRpcError, RpcId};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedTransport {
        url: String,
        calls: AtomicU32,
        outcome: Outcome,
    }

    enum Outcome {
        Ok,
        TransportFail,
        AppError,
    }

    #[async_trait]
    impl RpcTransport for ScriptedTransport {
        async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            match self.outcome {
                Outcome::Ok => Ok(JsonRpcResponse::ok(
                    req.id,
                    Value::String(self.url.clone()),
                )),
                Outcome::TransportFail => Err(TransportError::Http("refused".into())),
                Outcome::AppError => Err(TransportError::Rpc(JsonRpcError {
                    code: -32005,
                    message: "limit exceeded".into(),
                    data: None,
                })),
            }
        }
        fn url(&self) -> &str {
            &self.url
        }
    }

    fn scripted(url: &str, outcome: Outcome) -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport {
            url: url.into(),
            calls: AtomicU32::new(0),
            outcome,
        })
    }

    fn req() -> JsonRpcRequest {
        JsonRpcRequest::new(1, "eth_blockNumber", Value::Array(vec![]))
    }

    #[tokio::test]
    async fn primary_success_skips_fallbacks() {
        let primary = scripted("https://a", Outcome::Ok);
        let backup = scripted("https://b", Outcome::Ok);
        let fallback =
            FallbackTransport::new(vec![primary.clone(), backup.clone()]);

        let resp = fallback.send(req()).await.unwrap();
        assert_eq!(resp.result.unwrap(), "https://a");
        assert_eq!(backup.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn transport_failure_falls_through() {
        let primary = scripted("https://a", Outcome::TransportFail);
        let backup = scripted("https://b", Outcome::Ok);
        let fallback =
            FallbackTransport::new(vec![primary.clone(), backup.clone()]);

        let resp = fallback.send(req()).await.unwrap();
        assert_eq!(resp.result.unwrap(), "https://b");
        assert_eq!(primary.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn application_error_returns_immediately() {
        let primary = scripted("https://a", Outcome::AppError);
        let backup = scripted("https://b", Outcome::Ok);
        let fallback =
            FallbackTransport::new(vec![primary, backup.clone()]);

        let err = fallback.send(req()).await.unwrap_err();
        assert!(err.is_application());
        assert_eq!(backup.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn all_failed() {
        let fallback = FallbackTransport::new(vec![
            scripted("https://a", Outcome::TransportFail),
            scripted("https://b", Outcome::TransportFail),
        ]);
        let err = fallback.send(req()).await.unwrap_err();
        assert!(matches!(err, TransportError::AllTransportsFailed(_)));
    }
}
