//! chainfeed-core — foundation types for the chainfeed indexing engine.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator
//!     ├── RpcGateway        (chainfeed-rpc: transports, retries, caps)
//!     ├── CacheStore        (chainfeed-cache: blocks/logs/txs/intervals)
//!     ├── HistoricalFetcher ┐
//!     ├── LiveFollower      ├ (chainfeed-engine)
//!     ├── EventStream       │
//!     └── Dispatcher        ┘
//! ```
//!
//! This crate holds what every layer shares: networks, sources and their
//! fingerprints, cached chain records, interval arithmetic, the decoded
//! event type with its total order, checkpoints, and ABI event decoding.

pub mod abi;
pub mod error;
pub mod event;
pub mod interval;
pub mod network;
pub mod source;
pub mod types;

pub use abi::{ChildLocation, EventAbi, EventSchema, ParamKind};
pub use error::EngineError;
pub use event::{Checkpoint, EventOrderKey, IndexedEvent};
pub use interval::{BlockInterval, IntervalSet};
pub use network::Network;
pub use source::{EventSource, FactorySpec, SourceFingerprint, SourceKind, TopicFilter};
pub use types::{CachedBlock, CachedLog, CachedTransaction};
