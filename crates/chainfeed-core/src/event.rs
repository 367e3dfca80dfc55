//! Decoded events, their total order, and per-source checkpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CachedBlock, CachedLog, CachedTransaction};

// ─── Order key ───────────────────────────────────────────────────────────────

/// The total order over all events the engine dispatches.
///
/// Within a chain this is block order then log order; across chains events
/// interleave by block timestamp with the chain id as the deterministic
/// tiebreak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventOrderKey {
    pub timestamp: i64,
    pub chain_id: u64,
    pub block_number: u64,
    pub tx_index: u32,
    pub log_index: u32,
}

// ─── IndexedEvent ────────────────────────────────────────────────────────────

/// A fully decoded event, ready for handler dispatch.
#[derive(Debug, Clone)]
pub struct IndexedEvent {
    pub source_name: String,
    pub event_name: String,
    /// Named arguments decoded against the source ABI.
    pub args: Value,
    pub log: CachedLog,
    pub block: CachedBlock,
    /// The enclosing transaction, when hydrated.
    pub transaction: Option<CachedTransaction>,
    pub chain_id: u64,
}

impl IndexedEvent {
    pub fn order_key(&self) -> EventOrderKey {
        EventOrderKey {
            timestamp: self.block.timestamp,
            chain_id: self.chain_id,
            block_number: self.block.number,
            tx_index: self.log.tx_index,
            log_index: self.log.log_index,
        }
    }
}

// ─── Checkpoint ──────────────────────────────────────────────────────────────

/// Durable per-source cursor, persisted at dispatcher commit boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub chain_id: u64,
    pub source_name: String,
    pub block_number: u64,
    pub log_index: u32,
    /// Unix timestamp of the save.
    pub updated_at: i64,
}

impl Checkpoint {
    /// Returns `true` if an event at `(block_number, log_index)` is already
    /// covered by this checkpoint and must not be re-dispatched.
    pub fn covers(&self, block_number: u64, log_index: u32) -> bool {
        (block_number, log_index) <= (self.block_number, self.log_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ts: i64, chain: u64, block: u64, tx: u32, log: u32) -> EventOrderKey {
        EventOrderKey {
            timestamp: ts,
            chain_id: chain,
            block_number: block,
            tx_index: tx,
            log_index: log,
        }
    }

    #[test]
    fn order_is_timestamp_first() {
        // chain A block 10 ts=1000, chain B block 5 ts=1001, chain A block 11 ts=1002
        let a1 = key(1000, 1, 10, 0, 0);
        let b = key(1001, 2, 5, 0, 0);
        let a2 = key(1002, 1, 11, 0, 0);
        let mut events = vec![a2, b, a1];
        events.sort();
        assert_eq!(events, vec![a1, b, a2]);
    }

    #[test]
    fn chain_id_breaks_timestamp_ties() {
        let a = key(1000, 1, 50, 0, 0);
        let b = key(1000, 2, 10, 0, 0);
        assert!(a < b);
    }

    #[test]
    fn log_order_within_block() {
        let first = key(1000, 1, 10, 0, 0);
        let second = key(1000, 1, 10, 0, 1);
        let third = key(1000, 1, 10, 1, 0);
        assert!(first < second && second < third);
    }

    #[test]
    fn checkpoint_covers() {
        let cp = Checkpoint {
            chain_id: 1,
            source_name: "Token".into(),
            block_number: 100,
            log_index: 3,
            updated_at: 0,
        };
        assert!(cp.covers(100, 3));
        assert!(cp.covers(100, 2));
        assert!(cp.covers(99, 9));
        assert!(!cp.covers(100, 4));
        assert!(!cp.covers(101, 0));
    }
}
