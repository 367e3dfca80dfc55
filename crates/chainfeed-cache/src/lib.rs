//! chainfeed-cache — persistent store of blocks, logs, transactions,
//! synced intervals, and dispatch checkpoints.
//!
//! Backends:
//! - [`sqlite`] — embedded single-file store via `sqlx` (development)
//! - [`postgres`] — server-based store via `sqlx` (production, feature
//!   `postgres`)
//!
//! Both uphold the same contract: inserts are idempotent on primary key,
//! a slice commit is one transaction (the cache never claims interval
//! coverage it does not have), and `delete_from_block` restores a
//! consistent pre-reorg view.

use async_trait::async_trait;
use thiserror::Error;

use chainfeed_core::{
    BlockInterval, CachedBlock, CachedLog, CachedTransaction, Checkpoint, IntervalSet,
    SourceFingerprint,
};

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCache;

#[cfg(feature = "postgres")]
pub use postgres::PostgresCache;

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

/// The persistence seam between the fetchers and everything downstream.
///
/// Implementations serialize interval merges per `(chain, fingerprint)`
/// inside a transaction; block/log/tx inserts tolerate concurrency because
/// they are idempotent on primary key.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn insert_block(&self, block: &CachedBlock) -> Result<(), CacheError>;

    async fn insert_logs(&self, logs: &[CachedLog]) -> Result<(), CacheError>;

    async fn insert_transactions(&self, txs: &[CachedTransaction]) -> Result<(), CacheError>;

    /// Returns `true` if a block with this hash is already cached.
    async fn has_block(&self, chain_id: u64, hash: &str) -> Result<bool, CacheError>;

    /// Atomically merge `interval` into the stored disjoint set for
    /// `(chain_id, fingerprint)`.
    async fn record_interval(
        &self,
        chain_id: u64,
        fingerprint: &SourceFingerprint,
        interval: BlockInterval,
    ) -> Result<(), CacheError>;

    async fn cached_intervals(
        &self,
        chain_id: u64,
        fingerprint: &SourceFingerprint,
    ) -> Result<IntervalSet, CacheError>;

    /// Commit one fetched slice (logs, hydrated blocks and transactions,
    /// and the covered interval) in a single transaction.
    async fn commit_slice(
        &self,
        chain_id: u64,
        fingerprint: &SourceFingerprint,
        interval: BlockInterval,
        logs: &[CachedLog],
        blocks: &[CachedBlock],
        txs: &[CachedTransaction],
    ) -> Result<(), CacheError>;

    /// Cached logs in `range` for the given addresses and topic0
    /// selectors, ordered by `(block_number, log_index)`. Empty address
    /// list matches every address.
    async fn logs_matching(
        &self,
        chain_id: u64,
        range: BlockInterval,
        addresses: &[String],
        selectors: &[String],
    ) -> Result<Vec<CachedLog>, CacheError>;

    async fn block_by_hash(
        &self,
        chain_id: u64,
        hash: &str,
    ) -> Result<Option<CachedBlock>, CacheError>;

    async fn transaction_by_hash(
        &self,
        chain_id: u64,
        hash: &str,
    ) -> Result<Option<CachedTransaction>, CacheError>;

    /// Purge logs, blocks, and transactions at `block_number` and above,
    /// and truncate every interval to end at `block_number - 1`. Used on
    /// reorg rollback.
    async fn delete_from_block(&self, chain_id: u64, block_number: u64) -> Result<(), CacheError>;

    async fn load_checkpoint(
        &self,
        chain_id: u64,
        source_name: &str,
    ) -> Result<Option<Checkpoint>, CacheError>;

    /// Upsert a checkpoint.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CacheError>;

    async fn delete_checkpoint(&self, chain_id: u64, source_name: &str) -> Result<(), CacheError>;
}
