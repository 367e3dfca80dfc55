//! chainfeed-engine — the sync and indexing pipeline.
//!
//! # Pipeline
//!
//! ```text
//! Orchestrator
//!     ├── SourceResolver    (static + factory-derived address sets)
//!     ├── HistoricalFetcher (backfill: required = requested \ cached)
//!     ├── LiveFollower      (tail, reorg detection, finality promotion)
//!     ├── EventStream       (k-way merge into total order)
//!     └── Dispatcher        (user handlers + transactional RecordStore)
//! ```
//!
//! Handlers implement [`EventHandler`] (and optionally [`SetupHandler`]),
//! register on a [`HandlerRegistry`], and the [`Orchestrator`] runs the
//! whole thing against a configuration:
//!
//! ```rust,no_run
//! use chainfeed_engine::{Config, HandlerRegistry, Orchestrator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_json(&std::fs::read_to_string("chainfeed.json")?)?;
//! let registry = HandlerRegistry::new(); // register handlers here
//! let engine = Orchestrator::new(config, registry).launch().await?;
//! std::process::exit(engine.wait().await)
//! # }
//! ```

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod follower;
pub mod historical;
pub mod resolver;
pub mod stats;
pub mod store;
pub mod stream;

mod orchestrator;

pub use config::{Config, DatabaseConfig, TransportConfig};
pub use context::{ContractInfo, ContractReader, HandlerContext, NetworkInfo};
pub use dispatcher::{Dispatcher, EventHandler, HandlerRegistry, SetupHandler};
pub use follower::{ChainSuffix, LiveDelivery, LiveFollower, SuffixOutcome};
pub use historical::HistoricalFetcher;
pub use orchestrator::{Engine, Orchestrator};
pub use resolver::{ResolvedFilter, SourceResolver};
pub use stats::{HealthTracker, NetworkHealth, StatsObserver, StatsSnapshot};
pub use store::{Condition, EventPosition, FilterOp, FindMany, RecordStore, SortDir, StoreTxn};
pub use stream::{EventStream, SourceSpec, StreamItem};
