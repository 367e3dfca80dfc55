//! The event stream — merges historical (cache-scanned) and live
//! (follower-delivered) decoded events into one totally-ordered stream.
//!
//! Ordering contract: events are emitted by
//! `(block.timestamp, chain_id, block.number, tx_index, log_index)`.
//! Historical ranges merge with a k-way cursor per source; live events
//! buffer until every followed chain's watermark (the timestamp of its
//! latest delivered block) has passed them, which bounds cross-chain
//! skew by one polling interval. Nothing at or below a source's
//! checkpoint floor is ever emitted.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use chainfeed_cache::CacheStore;
use chainfeed_core::{
    abi::extract_child_address, CachedLog, EngineError, EventOrderKey, EventSource, IndexedEvent,
    SourceKind,
};

use crate::follower::LiveDelivery;
use crate::resolver::SourceResolver;

/// Blocks per historical cache scan.
const HIST_CHUNK: u64 = 5_000;

/// What the stream hands to the dispatcher.
#[derive(Debug)]
pub enum StreamItem {
    Event(IndexedEvent),
    /// Rollback marker: the dispatcher rewinds its store and checkpoints
    /// for this chain before any event from the new branch arrives.
    Reorg { chain_id: u64, from_block: u64 },
}

/// One source as the stream sees it.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub source: EventSource,
    pub chain_id: u64,
    /// Last block covered by the historical phase; live delivery begins
    /// after it.
    pub historical_end: u64,
}

/// Per-source floor: events at or below `(block, log_index)` are done.
type Floor = (u64, u32);

fn passes(floor: Option<&Floor>, block: u64, log_index: u32) -> bool {
    match floor {
        None => true,
        Some(&(fb, fl)) => (block, log_index) > (fb, fl),
    }
}

struct HistCursor {
    spec_idx: usize,
    next_from: u64,
    batch: VecDeque<IndexedEvent>,
}

/// A buffered live event, ordered by key then arrival.
struct Buffered {
    key: EventOrderKey,
    seq: u64,
    event: IndexedEvent,
}

impl PartialEq for Buffered {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq == other.seq
    }
}
impl Eq for Buffered {}
impl PartialOrd for Buffered {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Buffered {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.key, self.seq).cmp(&(other.key, other.seq))
    }
}

/// The merge stage between the fetch layers and the dispatcher.
pub struct EventStream {
    cache: Arc<dyn CacheStore>,
    resolver: Arc<SourceResolver>,
    specs: Vec<SourceSpec>,
    live_rx: mpsc::UnboundedReceiver<LiveDelivery>,
    out: mpsc::Sender<StreamItem>,
    /// Per-source emission floor, seeded from persisted checkpoints.
    floors: HashMap<String, Floor>,
    shutdown: watch::Receiver<bool>,
}

impl EventStream {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        resolver: Arc<SourceResolver>,
        specs: Vec<SourceSpec>,
        live_rx: mpsc::UnboundedReceiver<LiveDelivery>,
        out: mpsc::Sender<StreamItem>,
        floors: HashMap<String, Floor>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cache,
            resolver,
            specs,
            live_rx,
            out,
            floors,
            shutdown,
        }
    }

    /// Emit the historical phase, then follow live deliveries until
    /// shutdown. Live blocks queue in the channel while history drains,
    /// so delivery is effectively paused until then.
    pub async fn run(mut self) -> Result<(), EngineError> {
        self.run_historical().await?;
        info!("historical stream drained, switching to live");
        self.run_live().await
    }

    // ─── Historical ──────────────────────────────────────────────────────────

    async fn run_historical(&mut self) -> Result<(), EngineError> {
        let mut cursors: Vec<HistCursor> = self
            .specs
            .iter()
            .enumerate()
            .map(|(spec_idx, spec)| HistCursor {
                spec_idx,
                next_from: spec.source.start_block,
                batch: VecDeque::new(),
            })
            .collect();

        for cursor in &mut cursors {
            self.refill(cursor).await?;
        }


        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }
            let best = cursors
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.batch.front().map(|e| (e.order_key(), i)))
                .min()
                .map(|(_, i)| i);
            let Some(i) = best else { break };
            let Some(event) = cursors[i].batch.pop_front() else {
                break;
            };
            self.mark_floor(&event);
            self.out
                .send(StreamItem::Event(event))
                .await
                .map_err(|_| EngineError::Aborted("event stream closed".into()))?;
            if cursors[i].batch.is_empty() {
                self.refill(&mut cursors[i]).await?;
            }
        }
        Ok(())
    }

    /// Pull the next non-empty chunk of cached events for one source.
    async fn refill(&self, cursor: &mut HistCursor) -> Result<(), EngineError> {
        let spec = &self.specs[cursor.spec_idx];
        let end = spec
            .source
            .end_block
            .unwrap_or(spec.historical_end)
            .min(spec.historical_end);

        while cursor.batch.is_empty() && cursor.next_from <= end {
            let to = (cursor.next_from + HIST_CHUNK - 1).min(end);
            let filter = self.resolver.resolve(&spec.source);
            let is_factory = matches!(spec.source.kind, SourceKind::Factory(_));

            if !(is_factory && filter.addresses.is_empty()) {
                let logs = self
                    .cache
                    .logs_matching(
                        spec.chain_id,
                        chainfeed_core::BlockInterval::new(cursor.next_from, to),
                        &filter.addresses,
                        &filter.selectors,
                    )
                    .await
                    .map_err(|e| EngineError::CacheWrite(e.to_string()))?;

                let logs: Vec<CachedLog> = logs
                    .into_iter()
                    .filter(|log| self.log_in_scope(spec, log))
                    .collect();

                // CPU decode is batched and parallel; hydration stays
                // sequential against the cache.
                let decoded = spec.source.abi.decode_batch(&logs);
                for (log, result) in logs.into_iter().zip(decoded) {
                    let Some(result) = result else { continue };
                    let (event_name, args) = result?;
                    let block = self
                        .cache
                        .block_by_hash(spec.chain_id, &log.block_hash)
                        .await
                        .map_err(|e| EngineError::CacheWrite(e.to_string()))?
                        .ok_or_else(|| {
                            EngineError::CacheWrite(format!(
                                "cache interval claims block {} but header is missing",
                                log.block_hash
                            ))
                        })?;
                    let transaction = self
                        .cache
                        .transaction_by_hash(spec.chain_id, &log.tx_hash)
                        .await
                        .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
                    cursor.batch.push_back(IndexedEvent {
                        source_name: spec.source.name.clone(),
                        event_name,
                        args,
                        chain_id: spec.chain_id,
                        log,
                        block,
                        transaction,
                    });
                }
            }
            cursor.next_from = to + 1;
        }
        Ok(())
    }

    // ─── Live ────────────────────────────────────────────────────────────────

    async fn run_live(&mut self) -> Result<(), EngineError> {
        let chains: BTreeSet<u64> = self.specs.iter().map(|s| s.chain_id).collect();
        let mut watermarks: HashMap<u64, i64> = HashMap::new();
        let mut buffer: BinaryHeap<Reverse<Buffered>> = BinaryHeap::new();
        let mut seq = 0u64;
        let mut shutdown = self.shutdown.clone();

        loop {
            let delivery = tokio::select! {
                _ = shutdown.changed() => None,
                delivery = self.live_rx.recv() => delivery,
            };
            let Some(delivery) = delivery else {
                // Shutdown (or all followers gone): drain what is ordered.
                return self.flush_remaining(&mut buffer).await;
            };

            match delivery {
                LiveDelivery::Block { block, logs } => {
                    self.note_live_children(block.chain_id, &logs).await?;

                    for spec_idx in 0..self.specs.len() {
                        let spec = &self.specs[spec_idx];
                        if spec.chain_id != block.chain_id
                            || block.number <= spec.historical_end
                            || block.number < spec.source.start_block
                        {
                            continue;
                        }
                        if spec.source.end_block.is_some_and(|end| block.number > end) {
                            continue;
                        }
                        let filter = self.resolver.resolve(&spec.source);
                        for log in &logs {
                            if !filter.addresses.iter().any(|a| a == &log.address) {
                                continue;
                            }
                            if !self.log_in_scope(spec, log) {
                                continue;
                            }
                            let Some(schema) = log
                                .topic0()
                                .and_then(|t0| spec.source.abi.event_by_selector(t0))
                            else {
                                continue;
                            };
                            let args = schema.decode(log)?;
                            let transaction = self
                                .cache
                                .transaction_by_hash(spec.chain_id, &log.tx_hash)
                                .await
                                .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
                            let event = IndexedEvent {
                                source_name: spec.source.name.clone(),
                                event_name: schema.name.clone(),
                                args,
                                chain_id: spec.chain_id,
                                log: log.clone(),
                                block: block.clone(),
                                transaction,
                            };
                            buffer.push(Reverse(Buffered {
                                key: event.order_key(),
                                seq,
                                event,
                            }));
                            seq += 1;
                        }
                    }

                    watermarks.insert(block.chain_id, block.timestamp);
                    self.flush_ready(&mut buffer, &chains, &watermarks).await?;
                }
                LiveDelivery::Reorg {
                    chain_id,
                    from_block,
                } => {
                    // Invalidated buffered events never reach the
                    // dispatcher.
                    let kept: Vec<Reverse<Buffered>> = buffer
                        .drain()
                        .filter(|Reverse(b)| {
                            !(b.event.chain_id == chain_id && b.key.block_number >= from_block)
                        })
                        .collect();
                    buffer = kept.into_iter().collect();

                    // Lower floors so the new branch re-emits.
                    for spec in &self.specs {
                        if spec.chain_id != chain_id {
                            continue;
                        }
                        if let Some(floor) = self.floors.get_mut(&spec.source.name) {
                            *floor =
                                (*floor).min((from_block.saturating_sub(1), u32::MAX));
                        }
                    }
                    debug!(chain_id, from_block, "stream forwarding rollback");
                    self.out
                        .send(StreamItem::Reorg {
                            chain_id,
                            from_block,
                        })
                        .await
                        .map_err(|_| EngineError::Aborted("event stream closed".into()))?;
                }
            }
        }
    }

    /// Grow factory child sets from live creation events before the
    /// per-source pass, so a child's events in the same block count.
    async fn note_live_children(
        &self,
        chain_id: u64,
        logs: &[CachedLog],
    ) -> Result<(), EngineError> {
        for spec in &self.specs {
            if spec.chain_id != chain_id {
                continue;
            }
            let SourceKind::Factory(factory) = &spec.source.kind else {
                continue;
            };
            let Some(schema) = spec.source.abi.event_by_name(&factory.event) else {
                continue;
            };
            let selector = schema.selector();
            let location = schema.child_location(&factory.parameter)?;
            for log in logs {
                if log.address == factory.address
                    && log.topic0().is_some_and(|t0| t0.eq_ignore_ascii_case(&selector))
                {
                    let child = extract_child_address(log, location)?;
                    self.resolver
                        .note_child(&spec.source, chain_id, child, log.block_number)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Source-level scope checks shared by both phases: configured topic
    /// filter, block range, factory discovery block, and checkpoint floor.
    fn log_in_scope(&self, spec: &SourceSpec, log: &CachedLog) -> bool {
        if log.block_number < spec.source.start_block {
            return false;
        }
        if spec
            .source
            .end_block
            .is_some_and(|end| log.block_number > end)
        {
            return false;
        }
        if let Some(topics) = &spec.source.topics {
            if !topics.matches(&log.topics) {
                return false;
            }
        }
        if matches!(spec.source.kind, SourceKind::Factory(_)) {
            match self
                .resolver
                .child_discovery_block(&spec.source.name, &log.address)
            {
                Some(discovered) if log.block_number >= discovered => {}
                _ => return false,
            }
        }
        passes(
            self.floors.get(&spec.source.name),
            log.block_number,
            log.log_index,
        )
    }

    fn mark_floor(&mut self, event: &IndexedEvent) {
        self.floors.insert(
            event.source_name.clone(),
            (event.block.number, event.log.log_index),
        );
    }

    /// Emit buffered events once every followed chain's watermark has
    /// reached their timestamp.
    async fn flush_ready(
        &mut self,
        buffer: &mut BinaryHeap<Reverse<Buffered>>,
        chains: &BTreeSet<u64>,
        watermarks: &HashMap<u64, i64>,
    ) -> Result<(), EngineError> {
        while let Some(Reverse(top)) = buffer.peek() {
            let ready = chains
                .iter()
                .all(|chain| watermarks.get(chain).copied().unwrap_or(i64::MIN) >= top.key.timestamp);
            if !ready {
                break;
            }
            let Some(Reverse(buffered)) = buffer.pop() else {
                break;
            };
            if !passes(
                self.floors.get(&buffered.event.source_name),
                buffered.key.block_number,
                buffered.key.log_index,
            ) {
                continue;
            }
            self.mark_floor(&buffered.event);
            self.out
                .send(StreamItem::Event(buffered.event))
                .await
                .map_err(|_| EngineError::Aborted("event stream closed".into()))?;
        }
        Ok(())
    }

    /// On shutdown, emit everything left in key order.
    async fn flush_remaining(
        &mut self,
        buffer: &mut BinaryHeap<Reverse<Buffered>>,
    ) -> Result<(), EngineError> {
        while let Some(Reverse(buffered)) = buffer.pop() {
            if !passes(
                self.floors.get(&buffered.event.source_name),
                buffered.key.block_number,
                buffered.key.log_index,
            ) {
                continue;
            }
            self.mark_floor(&buffered.event);
            self.out
                .send(StreamItem::Event(buffered.event))
                .await
                .map_err(|_| EngineError::Aborted("event stream closed".into()))?;
        }
        Ok(())
    }
}
