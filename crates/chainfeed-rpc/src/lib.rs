//! chainfeed-rpc — the per-network JSON-RPC request channel.
//!
//! - [`RpcTransport`] — the async trait every transport implements
//! - [`HttpTransport`] / [`WsTransport`] / [`FallbackTransport`] — the
//!   three configured transport shapes
//! - [`RetryPolicy`] — exponential backoff + jitter for transport failures
//! - [`RpcGateway`] — bounded-concurrency gateway with typed `eth_*`
//!   helpers; the only thing the rest of the engine talks to

pub mod error;
pub mod fallback;
pub mod gateway;
pub mod http;
pub mod request;
pub mod retry;
pub mod transport;
pub mod ws;

pub use error::TransportError;
pub use fallback::FallbackTransport;
pub use gateway::{GatewayConfig, LogFilter, RpcGateway};
pub use http::HttpTransport;
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use retry::{RetryConfig, RetryPolicy};
pub use transport::RpcTransport;
pub use ws::{WsConfig, WsTransport};
