//! Pipeline counters, owned by the orchestrator and injected into every
//! stage that reports progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Process-wide counters. All methods are lock-free; stages hold an
/// `Arc<StatsObserver>`.
#[derive(Debug, Default)]
pub struct StatsObserver {
    logs_fetched: AtomicU64,
    blocks_fetched: AtomicU64,
    slices_committed: AtomicU64,
    events_dispatched: AtomicU64,
    cache_hits: AtomicU64,
    reorgs: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub logs_fetched: u64,
    pub blocks_fetched: u64,
    pub slices_committed: u64,
    pub events_dispatched: u64,
    pub cache_hits: u64,
    pub reorgs: u64,
}

impl StatsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_logs_fetched(&self, n: u64) {
        self.logs_fetched.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_blocks_fetched(&self, n: u64) {
        self.blocks_fetched.fetch_add(n, Ordering::Relaxed);
    }

    pub fn slice_committed(&self) {
        self.slices_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// A requested range fully served from the cache.
    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reorg(&self) {
        self.reorgs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            logs_fetched: self.logs_fetched.load(Ordering::Relaxed),
            blocks_fetched: self.blocks_fetched.load(Ordering::Relaxed),
            slices_committed: self.slices_committed.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            reorgs: self.reorgs.load(Ordering::Relaxed),
        }
    }
}

// ─── Health ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct NetworkProgress {
    tip: u64,
    processed: u64,
}

/// Per-network progress for the health check: the follower reports tips
/// and delivered blocks, the dispatcher reports dispatched blocks.
#[derive(Debug, Default)]
pub struct HealthTracker {
    progress: Mutex<HashMap<u64, NetworkProgress>>,
}

/// One network's health line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHealth {
    pub chain_id: u64,
    pub tip: u64,
    pub processed: u64,
    pub healthy: bool,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_tip(&self, chain_id: u64, tip: u64) {
        let mut progress = self.progress.lock().unwrap();
        let entry = progress.entry(chain_id).or_default();
        entry.tip = entry.tip.max(tip);
    }

    pub fn observe_processed(&self, chain_id: u64, block: u64) {
        let mut progress = self.progress.lock().unwrap();
        let entry = progress.entry(chain_id).or_default();
        entry.processed = entry.processed.max(block);
    }

    /// Healthy while every network's processed cursor trails its tip by
    /// at most `max_lag` blocks.
    pub fn report(&self, max_lag: u64) -> Vec<NetworkHealth> {
        self.progress
            .lock()
            .unwrap()
            .iter()
            .map(|(&chain_id, p)| NetworkHealth {
                chain_id,
                tip: p.tip,
                processed: p.processed,
                healthy: p.tip.saturating_sub(p.processed) <= max_lag,
            })
            .collect()
    }

    pub fn is_healthy(&self, max_lag: u64) -> bool {
        self.report(max_lag).iter().all(|n| n.healthy)
    }
}
