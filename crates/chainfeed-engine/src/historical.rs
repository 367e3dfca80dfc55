//! The historical fetcher — range-partitioned backfill of logs and their
//! block context into the cache.
//!
//! Per source: compute `required = requested \ cached`, split the required
//! ranges into slices of at most the network's block range, and drain the
//! slice queue with a bounded worker pool. A slice that the provider
//! rejects as too large is halved and re-enqueued. A slice commits its
//! logs, hydrated blocks, referenced transactions, and covered interval
//! in one cache transaction, so an aborted run never leaves the cache
//! claiming coverage it does not have.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use chainfeed_cache::CacheStore;
use chainfeed_core::{
    BlockInterval, CachedLog, EngineError, EventSource, Network, SourceKind,
};
use chainfeed_rpc::{LogFilter, RpcGateway};

use crate::resolver::{ResolvedFilter, SourceResolver};
use crate::stats::StatsObserver;

/// Backfills one network's sources up to the finality boundary.
#[derive(Clone)]
pub struct HistoricalFetcher {
    gateway: Arc<RpcGateway>,
    cache: Arc<dyn CacheStore>,
    network: Network,
    stats: Arc<StatsObserver>,
    shutdown: watch::Receiver<bool>,
}

impl HistoricalFetcher {
    pub fn new(
        gateway: Arc<RpcGateway>,
        cache: Arc<dyn CacheStore>,
        network: Network,
        stats: Arc<StatsObserver>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            gateway,
            cache,
            network,
            stats,
            shutdown,
        }
    }

    /// Sync a source's full historical range. For factories the parent's
    /// creation events are synced first, the child set materialized, then
    /// the children themselves. Returns the block the backfill reached
    /// (the finality boundary at the moment it began, or the source's end
    /// block if that is lower).
    pub async fn sync_source(
        &self,
        resolver: &SourceResolver,
        source: &EventSource,
        block_range: u64,
    ) -> Result<u64, EngineError> {
        let tip = self.gateway.block_number().await?;
        let finalized = self.network.finalized_block(tip);

        if matches!(source.kind, SourceKind::Factory(_)) {
            let parent = SourceResolver::synthetic_parent(source)?;
            let parent_filter = resolver.resolve(&parent);
            self.sync_filter(&parent_filter, finalized, block_range, false)
                .await?;
            resolver
                .materialize_children(source, self.network.chain_id, finalized)
                .await?;
        }

        let filter = resolver.resolve(source);
        let is_factory = matches!(source.kind, SourceKind::Factory(_));
        self.sync_filter(&filter, finalized, block_range, is_factory)
            .await?;

        let sync_end = filter.end_block.unwrap_or(finalized).min(finalized);
        info!(
            network = %self.network.name,
            source = %source.name,
            sync_end,
            "historical sync complete"
        );
        Ok(sync_end)
    }

    /// Backfill one resolved filter up to `finalized`.
    async fn sync_filter(
        &self,
        filter: &ResolvedFilter,
        finalized: u64,
        block_range: u64,
        is_factory: bool,
    ) -> Result<(), EngineError> {
        let sync_end = filter.end_block.unwrap_or(finalized).min(finalized);
        if sync_end < filter.start_block {
            return Ok(());
        }
        let requested = BlockInterval::new(filter.start_block, sync_end);

        // A factory with no children yet matches nothing; the range is
        // trivially covered. (An empty static address list means "every
        // address" and must still fetch.)
        if is_factory && filter.addresses.is_empty() {
            self.cache
                .record_interval(self.network.chain_id, &filter.fingerprint, requested)
                .await
                .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
            return Ok(());
        }

        let cached = self
            .cache
            .cached_intervals(self.network.chain_id, &filter.fingerprint)
            .await
            .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
        let required = cached.subtract_from(requested);
        if required.is_empty() {
            debug!(
                network = %self.network.name,
                %requested,
                "range fully cached"
            );
            self.stats.cache_hit();
            return Ok(());
        }

        let mut slices = Vec::new();
        for range in required {
            let mut from = range.from;
            while from <= range.to {
                let to = (from + block_range - 1).min(range.to);
                slices.push(BlockInterval::new(from, to));
                from = to + 1;
            }
        }
        debug!(
            network = %self.network.name,
            slices = slices.len(),
            "planned log slices"
        );

        self.run_slices(filter, slices).await
    }

    /// Drain a set of slices through the per-network worker pool.
    async fn run_slices(
        &self,
        filter: &ResolvedFilter,
        slices: Vec<BlockInterval>,
    ) -> Result<(), EngineError> {
        if slices.is_empty() {
            return Ok(());
        }
        let (task_tx, task_rx) = mpsc::unbounded_channel::<BlockInterval>();
        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        let pending = Arc::new(AtomicUsize::new(slices.len()));
        let drained = Arc::new(Notify::new());
        let first_error: Arc<Mutex<Option<EngineError>>> = Arc::new(Mutex::new(None));
        let (close_tx, close_rx) = watch::channel(false);

        for slice in slices {
            let _ = task_tx.send(slice);
        }

        let workers = self.network.max_task_concurrency.max(1);
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let fetcher = self.clone();
            let filter = filter.clone();
            let task_tx = task_tx.clone();
            let task_rx = task_rx.clone();
            let pending = pending.clone();
            let drained = drained.clone();
            let first_error = first_error.clone();
            let mut close_rx = close_rx.clone();
            let mut shutdown = self.shutdown.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let slice = {
                        let mut rx = task_rx.lock().await;
                        tokio::select! {
                            _ = close_rx.changed() => break,
                            _ = shutdown.changed() => break,
                            task = rx.recv() => match task {
                                Some(slice) => slice,
                                None => break,
                            },
                        }
                    };

                    // Once an error is recorded, remaining slices drain
                    // without fetching; their intervals stay uncommitted.
                    let errored = first_error.lock().unwrap().is_some();
                    if !errored {
                        match fetcher.fetch_slice(&filter, slice).await {
                            Ok(()) => {}
                            Err(e) if e.is_range_too_large() && slice.len() > 1 => {
                                let mid = slice.from + slice.len() / 2;
                                warn!(
                                    %slice,
                                    mid,
                                    "provider rejected range, halving"
                                );
                                pending.fetch_add(2, Ordering::SeqCst);
                                let _ = task_tx.send(BlockInterval::new(slice.from, mid - 1));
                                let _ = task_tx.send(BlockInterval::new(mid, slice.to));
                            }
                            Err(e) => {
                                first_error.lock().unwrap().get_or_insert(e);
                            }
                        }
                    }

                    if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                        // notify_one stores a permit, so completion is not
                        // lost if the supervisor is not yet waiting.
                        drained.notify_one();
                        break;
                    }
                }
            }));
        }

        // The workers hold their own senders for re-enqueued halves.
        drop(task_tx);

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = drained.notified() => {}
            _ = shutdown.changed() => {
                let _ = close_tx.send(true);
                for handle in handles {
                    let _ = handle.await;
                }
                return Err(EngineError::Aborted("historical fetch".into()));
            }
        }

        let _ = close_tx.send(true);
        for handle in handles {
            let _ = handle.await;
        }

        let result = first_error.lock().unwrap().take();
        match result {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Fetch one slice and commit it atomically: logs, hydrated blocks,
    /// referenced transactions, and the covered interval.
    async fn fetch_slice(
        &self,
        filter: &ResolvedFilter,
        slice: BlockInterval,
    ) -> Result<(), EngineError> {
        let log_filter = LogFilter {
            from_block: slice.from,
            to_block: slice.to,
            addresses: filter.addresses.clone(),
            topics: topic_slots(filter),
        };
        let logs = self.gateway.get_logs(&log_filter).await?;
        let logs: Vec<CachedLog> = logs
            .into_iter()
            .filter(|log| {
                filter
                    .topics
                    .as_ref()
                    .is_none_or(|t| t.matches(&log.topics))
            })
            .collect();
        self.stats.add_logs_fetched(logs.len() as u64);

        // Hydrate the distinct blocks the logs reference, skipping blocks
        // already in the cache. Transactions are retained only when a log
        // references them.
        let hashes: BTreeSet<&String> = logs.iter().map(|l| &l.block_hash).collect();
        let wanted_txs: BTreeSet<&String> = logs.iter().map(|l| &l.tx_hash).collect();
        let mut blocks = Vec::new();
        let mut txs = Vec::new();
        for hash in hashes {
            if self
                .cache
                .has_block(self.network.chain_id, hash)
                .await
                .map_err(|e| EngineError::CacheWrite(e.to_string()))?
            {
                continue;
            }
            let (block, block_txs) = self
                .gateway
                .get_block_by_hash(hash, true)
                .await?
                .ok_or_else(|| {
                    EngineError::RpcUnavailable(format!("block {hash} not found during backfill"))
                })?;
            blocks.push(block);
            txs.extend(
                block_txs
                    .into_iter()
                    .filter(|tx| wanted_txs.contains(&tx.hash)),
            );
        }
        self.stats.add_blocks_fetched(blocks.len() as u64);

        self.cache
            .commit_slice(
                self.network.chain_id,
                &filter.fingerprint,
                slice,
                &logs,
                &blocks,
                &txs,
            )
            .await
            .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
        self.stats.slice_committed();
        Ok(())
    }
}

/// Build the `eth_getLogs` topic slots: topic0 is the source's selector
/// set, slots 1-3 come from the configured filter.
pub(crate) fn topic_slots(filter: &ResolvedFilter) -> Vec<Option<Vec<String>>> {
    let configured = filter.topics.clone().unwrap_or_default();
    vec![
        Some(filter.selectors.clone()),
        configured.topic1,
        configured.topic2,
        configured.topic3,
    ]
}

