//! Cached chain records — the rows the cache store persists.

use serde::{Deserialize, Serialize};

// ─── CachedBlock ─────────────────────────────────────────────────────────────

/// A block header as retained by the cache, identified by `(chain_id, hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedBlock {
    pub chain_id: u64,
    /// Block hash (`0x…`, lowercase).
    pub hash: String,
    /// Parent block hash (`0x…`, lowercase).
    pub parent_hash: String,
    pub number: u64,
    /// Unix timestamp (seconds).
    pub timestamp: i64,
    /// Header fields handlers may read; hydrated from `eth_getBlockBy*`.
    pub gas_used: Option<String>,
    pub miner: Option<String>,
}

impl CachedBlock {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &CachedBlock) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── CachedLog ───────────────────────────────────────────────────────────────

/// A log as retained by the cache, identified by
/// `(chain_id, block_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedLog {
    pub chain_id: u64,
    pub block_hash: String,
    pub block_number: u64,
    pub log_index: u32,
    /// Emitting contract address (`0x…`, lowercase).
    pub address: String,
    /// Up to four topics; `topics[0]` is the event selector.
    pub topics: Vec<String>,
    /// ABI-encoded non-indexed data (`0x…`).
    pub data: String,
    pub tx_hash: String,
    pub tx_index: u32,
}

impl CachedLog {
    /// The event selector, if the log has any topics.
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

// ─── CachedTransaction ───────────────────────────────────────────────────────

/// A transaction as retained by the cache, identified by `(chain_id, hash)`.
/// Hydrated only when at least one retained log references it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedTransaction {
    pub chain_id: u64,
    pub hash: String,
    pub block_hash: String,
    pub tx_index: u32,
    pub from: String,
    /// `None` for contract creations.
    pub to: Option<String>,
    /// Value in wei, decimal string.
    pub value: String,
    /// Calldata (`0x…`).
    pub input: String,
    pub nonce: u64,
}

// ─── Hex helpers ─────────────────────────────────────────────────────────────

/// Parse a hex quantity (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> u64 {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).unwrap_or(0)
}

/// Format a block number as a `0x…` hex quantity.
pub fn to_hex(n: u64) -> String {
    format!("0x{n:x}")
}

/// Lowercase a `0x…` hex string in place of the caller's copy.
pub fn normalize_hex(s: &str) -> String {
    s.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn block(chain_id: u64, number: u64, hash: &str, parent: &str) -> CachedBlock {
        CachedBlock {
            chain_id,
            hash: hash.into(),
            parent_hash: parent.into(),
            number,
            timestamp: (number * 12) as i64,
            gas_used: None,
            miner: None,
        }
    }

    #[test]
    fn block_extends_parent() {
        let parent = block(1, 100, "0xaaa", "0x000");
        let child = block(1, 101, "0xbbb", "0xaaa");
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn block_extends_false_on_gap() {
        let a = block(1, 100, "0xaaa", "0x000");
        let b = block(1, 102, "0xccc", "0xaaa"); // gap
        assert!(!b.extends(&a));
    }

    #[test]
    fn hex_roundtrip() {
        assert_eq!(parse_hex_u64("0x1"), 1);
        assert_eq!(parse_hex_u64("0xff"), 255);
        assert_eq!(parse_hex_u64(&to_hex(5_000_000_000)), 5_000_000_000);
    }

    #[test]
    fn normalize_lowercases() {
        assert_eq!(normalize_hex("0xAbCd"), "0xabcd");
    }
}
