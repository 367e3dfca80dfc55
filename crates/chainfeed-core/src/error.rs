//! Error types for the chainfeed pipeline.

use thiserror::Error;

/// Errors that can occur while syncing and indexing.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid configuration — unrecoverable at startup.
    #[error("config error: {0}")]
    Config(String),

    /// RPC transport exhausted all retries and fallbacks for a network.
    #[error("RPC unavailable: {0}")]
    RpcUnavailable(String),

    /// Error returned by the node itself (not a transport failure).
    /// Surfaced to the caller; may trigger range halving.
    #[error("RPC application error {code}: {message}")]
    RpcApplication { code: i64, message: String },

    /// Cache read/write failed after retries.
    #[error("cache error: {0}")]
    CacheWrite(String),

    /// A user handler returned an error.
    #[error("handler failed for '{source_name}.{event}': {reason}")]
    Handler {
        source_name: String,
        event: String,
        reason: String,
    },

    /// A log could not be decoded against the source ABI.
    #[error("decode error: {0}")]
    Decode(String),

    /// The chain reorganized deeper than the configured finality depth.
    /// Fatal — requires manual intervention.
    #[error("reorg beyond finality depth: fork at block {fork_block}, depth {depth}")]
    DeepReorg { fork_block: u64, depth: u64 },

    /// The engine was shut down before the operation completed.
    #[error("aborted: {0}")]
    Aborted(String),
}

impl EngineError {
    /// Returns `true` if the node rejected an `eth_getLogs` span as too
    /// large, in which case the fetcher halves the range and retries.
    ///
    /// Providers signal this inconsistently: some use -32005 (limit
    /// exceeded), some -32602 (invalid params) with a prose message.
    pub fn is_range_too_large(&self) -> bool {
        match self {
            Self::RpcApplication { code, message } => {
                *code == -32005
                    || *code == -32600 && message.contains("range")
                    || *code == -32602 && message.contains("range")
                    || message.contains("block range")
                    || message.contains("range too large")
                    || message.contains("query returned more than")
            }
            _ => false,
        }
    }

    /// Process exit code for a terminal error (§ healthcheck contract:
    /// 0 clean, 1 config/handler, 2 RPC permanently unavailable).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::RpcUnavailable(_) => 2,
            _ => 1,
        }
    }
}
