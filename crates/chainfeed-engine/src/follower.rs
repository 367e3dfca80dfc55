//! The live follower — tails new blocks per network, detects reorgs, and
//! hands confirmed-or-better blocks to the event stream.
//!
//! The follower keeps a suffix of recent headers (hash + parent hash) one
//! finality depth deep. A new head either extends the suffix or forks it;
//! on a fork the follower walks back through `eth_getBlockByHash` to the
//! common ancestor, truncates the cache, emits a rollback marker, and
//! replays the new segment. A fork below the finality boundary is fatal.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use chainfeed_cache::CacheStore;
use chainfeed_core::{
    BlockInterval, CachedBlock, CachedLog, EngineError, EventSource, Network, SourceKind,
};
use chainfeed_rpc::{LogFilter, RpcGateway};

use crate::resolver::SourceResolver;
use crate::stats::{HealthTracker, StatsObserver};

// ─── ChainSuffix ─────────────────────────────────────────────────────────────

/// Outcome of offering a new head to the suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuffixOutcome {
    /// The block extends the current tip.
    Extended,
    /// The block does not extend the tip (fork or same-height replacement).
    Fork,
}

/// Sliding window of the most recent block headers, newest last.
pub struct ChainSuffix {
    window: VecDeque<CachedBlock>,
    capacity: usize,
}

impl ChainSuffix {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Offer a new head. `Extended` pushes it; `Fork` leaves the suffix
    /// untouched for the caller's ancestor walk.
    pub fn offer(&mut self, block: &CachedBlock) -> SuffixOutcome {
        match self.window.back() {
            None => {
                self.push(block.clone());
                SuffixOutcome::Extended
            }
            Some(head) if block.extends(head) => {
                self.push(block.clone());
                SuffixOutcome::Extended
            }
            Some(_) => SuffixOutcome::Fork,
        }
    }

    fn push(&mut self, block: CachedBlock) {
        if self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(block);
    }

    pub fn head(&self) -> Option<&CachedBlock> {
        self.window.back()
    }

    /// The block number of the suffix entry with this hash, if present.
    pub fn number_of_hash(&self, hash: &str) -> Option<u64> {
        self.window
            .iter()
            .rev()
            .find(|b| b.hash == hash)
            .map(|b| b.number)
    }

    /// Drop every entry with a number above `block_number`.
    pub fn truncate_above(&mut self, block_number: u64) {
        while let Some(back) = self.window.back() {
            if back.number > block_number {
                self.window.pop_back();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

// ─── Live deliveries ─────────────────────────────────────────────────────────

/// What the follower hands to the event stream.
#[derive(Debug)]
pub enum LiveDelivery {
    /// A new confirmed-chain block with the logs matching the union of
    /// active source filters. Empty `logs` still advances the stream's
    /// watermark for cross-chain ordering.
    Block {
        block: CachedBlock,
        logs: Vec<CachedLog>,
    },
    /// The chain reorganized; everything from `from_block` up is invalid.
    Reorg { chain_id: u64, from_block: u64 },
}

// ─── LiveFollower ────────────────────────────────────────────────────────────

/// Tails one network. Owned by the orchestrator for the process lifetime;
/// delivery is unbounded so blocks queue up while the stream is still
/// draining history.
pub struct LiveFollower {
    gateway: Arc<RpcGateway>,
    cache: Arc<dyn CacheStore>,
    network: Network,
    resolver: Arc<SourceResolver>,
    sources: Vec<EventSource>,
    out: mpsc::UnboundedSender<LiveDelivery>,
    stats: Arc<StatsObserver>,
    health: Arc<HealthTracker>,
    shutdown: watch::Receiver<bool>,
}

impl LiveFollower {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<RpcGateway>,
        cache: Arc<dyn CacheStore>,
        network: Network,
        resolver: Arc<SourceResolver>,
        sources: Vec<EventSource>,
        out: mpsc::UnboundedSender<LiveDelivery>,
        stats: Arc<StatsObserver>,
        health: Arc<HealthTracker>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            gateway,
            cache,
            network,
            resolver,
            sources,
            out,
            stats,
            health,
            shutdown,
        }
    }

    /// Follow the chain from `start_block` until shutdown.
    pub async fn run(self, start_block: u64) -> Result<(), EngineError> {
        let mut suffix = ChainSuffix::new((self.network.finality_depth + 8) as usize);

        // Anchor the suffix so the very first live block gets a parent
        // check.
        if start_block > 0 {
            if let Some((anchor, _)) = self
                .gateway
                .get_block_by_number(start_block - 1, false)
                .await?
            {
                suffix.offer(&anchor);
            }
        }

        let mut heads = if self.gateway.supports_subscriptions() {
            self.gateway.subscribe_new_heads().await.ok()
        } else {
            None
        };
        let poll = self.network.polling_interval();
        let mut next = start_block;
        // Highest block already promoted to the cache's interval layer.
        let mut finality_cursor = start_block.saturating_sub(1);

        info!(
            network = %self.network.name,
            start_block,
            via = if heads.is_some() { "newHeads" } else { "polling" },
            "live follower started"
        );

        loop {
            // Wait for the next wakeup: a pushed head, the poll timer, or
            // shutdown.
            let mut shutdown = self.shutdown.clone();
            if *shutdown.borrow() {
                return Ok(());
            }
            match &mut heads {
                Some(rx) => {
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        head = rx.recv() => {
                            if head.is_none() {
                                // Subscription lost; fall back to polling.
                                heads = None;
                            }
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            }

            let tip = self.gateway.block_number().await?;
            self.health.observe_tip(self.network.chain_id, tip);

            while next <= tip {
                if *self.shutdown.borrow() {
                    return Ok(());
                }
                let Some((block, _)) = self.gateway.get_block_by_number(next, false).await?
                else {
                    break; // not yet visible on this provider
                };
                match suffix.offer(&block) {
                    SuffixOutcome::Extended => {
                        self.deliver_block(&block).await?;
                        next = block.number + 1;
                    }
                    SuffixOutcome::Fork => {
                        next = self
                            .handle_reorg(&mut suffix, block, finality_cursor)
                            .await?;
                    }
                }
            }

            // Promote newly finalized blocks to the cache's interval
            // layer so restarts reuse them.
            let finalized = self.network.finalized_block(tip);
            let promotable_to = finalized.min(next.saturating_sub(1));
            if promotable_to > finality_cursor && next > start_block {
                let interval =
                    BlockInterval::new(finality_cursor + 1, promotable_to);
                for source in &self.sources {
                    let fingerprint = self.resolver.fingerprint(source);
                    self.cache
                        .record_interval(self.network.chain_id, &fingerprint, interval)
                        .await
                        .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
                }
                finality_cursor = promotable_to;
                debug!(
                    network = %self.network.name,
                    %interval,
                    "live blocks promoted to final"
                );
            }
        }
    }

    /// Fetch a block's matching logs, cache everything, and deliver.
    async fn deliver_block(&self, block: &CachedBlock) -> Result<(), EngineError> {
        let (addresses, selectors) = self.union_filter();
        let logs = if addresses.is_empty() && !self.has_static_source() {
            // Only factories with no children yet: nothing can match.
            Vec::new()
        } else {
            self.gateway
                .get_logs(&LogFilter {
                    from_block: block.number,
                    to_block: block.number,
                    addresses,
                    topics: vec![Some(selectors)],
                })
                .await?
        };

        self.cache
            .insert_block(block)
            .await
            .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
        if !logs.is_empty() {
            self.cache
                .insert_logs(&logs)
                .await
                .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
            // Hydrate the transactions the logs reference.
            if let Some((_, block_txs)) = self
                .gateway
                .get_block_by_number(block.number, true)
                .await?
            {
                let wanted: BTreeSet<&String> = logs.iter().map(|l| &l.tx_hash).collect();
                let referenced: Vec<_> = block_txs
                    .into_iter()
                    .filter(|tx| wanted.contains(&tx.hash))
                    .collect();
                self.cache
                    .insert_transactions(&referenced)
                    .await
                    .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
            }
        }

        self.stats.add_logs_fetched(logs.len() as u64);
        self.stats.add_blocks_fetched(1);
        self.health
            .observe_processed(self.network.chain_id, block.number);
        let _ = self.out.send(LiveDelivery::Block {
            block: block.clone(),
            logs,
        });
        Ok(())
    }

    /// Walk back to the common ancestor, roll the cache back, and replay
    /// the new canonical segment. Returns the next block to process.
    async fn handle_reorg(
        &self,
        suffix: &mut ChainSuffix,
        new_head: CachedBlock,
        finality_cursor: u64,
    ) -> Result<u64, EngineError> {
        let mut segment = vec![new_head.clone()];
        let mut parent_hash = new_head.parent_hash.clone();
        let ancestor = loop {
            if let Some(number) = suffix.number_of_hash(&parent_hash) {
                break number;
            }
            if segment.len() as u64 > self.network.finality_depth {
                return Err(EngineError::DeepReorg {
                    fork_block: new_head.number,
                    depth: segment.len() as u64,
                });
            }
            let (parent, _) = self
                .gateway
                .get_block_by_hash(&parent_hash, false)
                .await?
                .ok_or_else(|| {
                    EngineError::RpcUnavailable(format!(
                        "block {parent_hash} vanished during reorg walk"
                    ))
                })?;
            parent_hash = parent.parent_hash.clone();
            segment.push(parent);
        };

        let from_block = ancestor + 1;
        if from_block <= finality_cursor {
            return Err(EngineError::DeepReorg {
                fork_block: from_block,
                depth: finality_cursor - ancestor,
            });
        }

        warn!(
            network = %self.network.name,
            fork_at = from_block,
            depth = segment.len(),
            "reorg detected, rolling back"
        );
        self.stats.reorg();

        // Order matters: downstream must see the rollback marker before
        // any block from the new branch.
        let _ = self.out.send(LiveDelivery::Reorg {
            chain_id: self.network.chain_id,
            from_block,
        });
        self.cache
            .delete_from_block(self.network.chain_id, from_block)
            .await
            .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
        suffix.truncate_above(ancestor);

        // Replay the new canonical segment in ascending order.
        for block in segment.into_iter().rev() {
            suffix.offer(&block);
            self.deliver_block(&block).await?;
        }

        Ok(new_head.number + 1)
    }

    /// Union of every source's current addresses and selectors. Factory
    /// parents are included so live creation events keep growing the
    /// child set.
    fn union_filter(&self) -> (Vec<String>, Vec<String>) {
        let mut addresses = BTreeSet::new();
        let mut selectors = BTreeSet::new();
        for source in &self.sources {
            let filter = self.resolver.resolve(source);
            addresses.extend(filter.addresses);
            selectors.extend(filter.selectors);
            if let SourceKind::Factory(spec) = &source.kind {
                addresses.insert(spec.address.clone());
            }
        }
        (
            addresses.into_iter().collect(),
            selectors.into_iter().collect(),
        )
    }

    fn has_static_source(&self) -> bool {
        self.sources
            .iter()
            .any(|s| matches!(s.kind, SourceKind::Static { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, hash: &str, parent: &str) -> CachedBlock {
        CachedBlock {
            chain_id: 1,
            hash: hash.into(),
            parent_hash: parent.into(),
            number,
            timestamp: (number * 12) as i64,
            gas_used: None,
            miner: None,
        }
    }

    #[test]
    fn suffix_extends_normal_chain() {
        let mut suffix = ChainSuffix::new(10);
        assert_eq!(suffix.offer(&block(100, "0xa", "0x0")), SuffixOutcome::Extended);
        assert_eq!(suffix.offer(&block(101, "0xb", "0xa")), SuffixOutcome::Extended);
        assert_eq!(suffix.head().unwrap().number, 101);
    }

    #[test]
    fn suffix_flags_fork() {
        let mut suffix = ChainSuffix::new(10);
        suffix.offer(&block(100, "0xa", "0x0"));
        suffix.offer(&block(101, "0xb", "0xa"));
        // Same-height replacement
        assert_eq!(
            suffix.offer(&block(101, "0xb2", "0xa")),
            SuffixOutcome::Fork
        );
        // Child of the replacement
        assert_eq!(
            suffix.offer(&block(102, "0xc", "0xb2")),
            SuffixOutcome::Fork
        );
        // Suffix unchanged by fork offers
        assert_eq!(suffix.head().unwrap().hash, "0xb");
    }

    #[test]
    fn suffix_ancestor_lookup_and_truncate() {
        let mut suffix = ChainSuffix::new(10);
        suffix.offer(&block(100, "0xa", "0x0"));
        suffix.offer(&block(101, "0xb", "0xa"));
        suffix.offer(&block(102, "0xc", "0xb"));

        assert_eq!(suffix.number_of_hash("0xa"), Some(100));
        assert_eq!(suffix.number_of_hash("0xzz"), None);

        suffix.truncate_above(100);
        assert_eq!(suffix.head().unwrap().number, 100);
        assert_eq!(suffix.len(), 1);
    }

    #[test]
    fn suffix_capacity_evicts_oldest() {
        let mut suffix = ChainSuffix::new(3);
        let mut parent = "0x0".to_string();
        for n in 0..6u64 {
            let hash = format!("0x{n}");
            suffix.offer(&block(n, &hash, &parent));
            parent = hash;
        }
        assert_eq!(suffix.len(), 3);
        assert_eq!(suffix.number_of_hash("0x2"), None); // evicted
        assert_eq!(suffix.number_of_hash("0x5"), Some(5));
    }
}
