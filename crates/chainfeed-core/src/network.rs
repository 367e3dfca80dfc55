//! Network description — one entry per chain the engine follows.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A chain the engine indexes. Constructed from configuration at startup,
/// immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    /// Stable name used in logs and source bindings (e.g. `"mainnet"`).
    pub name: String,
    /// EIP-155 chain id.
    pub chain_id: u64,
    /// How often the live follower polls for a new head (milliseconds).
    pub polling_interval_ms: u64,
    /// Default maximum span of a single `eth_getLogs` request.
    pub max_block_range: u64,
    /// Maximum concurrent historical fetch tasks for this network.
    pub max_task_concurrency: usize,
    /// Blocks behind the tip considered immutable.
    pub finality_depth: u64,
}

impl Network {
    pub fn new(name: impl Into<String>, chain_id: u64) -> Self {
        Self {
            name: name.into(),
            chain_id,
            polling_interval_ms: 1_000,
            max_block_range: default_block_range(chain_id),
            max_task_concurrency: 10,
            finality_depth: default_finality_depth(chain_id),
        }
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// The highest block considered final given the current tip.
    pub fn finalized_block(&self, tip: u64) -> u64 {
        tip.saturating_sub(self.finality_depth)
    }
}

/// Default `eth_getLogs` span by chain id.
///
/// Purely a performance default; correctness does not depend on it, the
/// fetcher halves any range the provider rejects.
pub fn default_block_range(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet and common testnets
        1 | 11155111 | 17000 => 2_000,
        // Optimism / Base / Arbitrum: fast blocks, large spans are fine
        10 | 8453 | 42161 => 10_000,
        // Polygon PoS providers throttle aggressively
        137 => 800,
        // BSC public endpoints cap hard
        56 => 800,
        _ => 10_000,
    }
}

/// Default finality depth by chain id.
pub fn default_finality_depth(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum PoS: two epochs
        1 | 11155111 | 17000 => 64,
        // Polygon PoS reorgs deep
        137 => 128,
        // OP-stack / Arbitrum: sequencer rarely reorgs
        10 | 8453 | 42161 => 5,
        _ => 30,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalized_block_saturates() {
        let net = Network::new("mainnet", 1);
        assert_eq!(net.finalized_block(100), 100 - net.finality_depth);
        assert_eq!(net.finalized_block(3), 0); // tip below depth
    }

    #[test]
    fn range_defaults() {
        assert_eq!(default_block_range(137), 800);
        assert_eq!(default_block_range(42161), 10_000);
        assert_eq!(default_block_range(999_999), 10_000);
    }
}
