//! Transport-level error types.

use thiserror::Error;

use crate::request::JsonRpcError;

/// Errors from a single RPC transport operation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection-level HTTP failure (refused, DNS, broken pipe).
    #[error("HTTP error: {0}")]
    Http(String),

    /// Non-success HTTP status from the provider.
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON-RPC error returned by the node. Application-level: never
    /// retried by the gateway, surfaced to the caller.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Request timed out; treated as a transport failure.
    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Every transport in a fallback chain failed.
    #[error("all transports failed: {0}")]
    AllTransportsFailed(String),

    /// The transport does not support subscriptions.
    #[error("subscriptions not supported by {0}")]
    SubscriptionsUnsupported(String),

    /// Response could not be deserialized.
    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// The transport's background task is gone.
    #[error("transport closed: {0}")]
    Closed(String),
}

impl TransportError {
    /// Returns `true` if the failure is transient and the request may be
    /// retried: connection errors, timeouts, HTTP 429 and 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::WebSocket(_) | Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::AllTransportsFailed(_) => true,
            _ => false,
        }
    }

    /// Returns `true` if this is an error the node itself produced.
    pub fn is_application(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_server_errors_retry() {
        assert!(TransportError::HttpStatus { status: 429, body: String::new() }.is_retryable());
        assert!(TransportError::HttpStatus { status: 503, body: String::new() }.is_retryable());
        assert!(!TransportError::HttpStatus { status: 400, body: String::new() }.is_retryable());
    }

    #[test]
    fn rpc_errors_do_not_retry() {
        let err = TransportError::Rpc(JsonRpcError {
            code: -32005,
            message: "limit exceeded".into(),
            data: None,
        });
        assert!(!err.is_retryable());
        assert!(err.is_application());
    }

    #[test]
    fn timeouts_retry() {
        assert!(TransportError::Timeout { ms: 30_000 }.is_retryable());
    }
}
