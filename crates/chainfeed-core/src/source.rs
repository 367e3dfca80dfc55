//! Event sources — the configured (chain, addresses, events, range) units
//! the engine syncs, plus the fingerprints that key the cache.

use alloy_primitives::keccak256;
use serde::{Deserialize, Serialize};

use crate::abi::EventAbi;
use crate::error::EngineError;

// ─── Filters ─────────────────────────────────────────────────────────────────

/// Optional topic filters beyond the event selector. Each slot matches any
/// of its values; `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicFilter {
    pub topic1: Option<Vec<String>>,
    pub topic2: Option<Vec<String>>,
    pub topic3: Option<Vec<String>>,
}

impl TopicFilter {
    pub fn is_empty(&self) -> bool {
        self.topic1.is_none() && self.topic2.is_none() && self.topic3.is_none()
    }

    /// Returns `true` if a log's topics satisfy this filter.
    pub fn matches(&self, topics: &[String]) -> bool {
        let slot = |want: &Option<Vec<String>>, idx: usize| match want {
            None => true,
            Some(values) => topics
                .get(idx)
                .is_some_and(|t| values.iter().any(|v| v.eq_ignore_ascii_case(t))),
        };
        slot(&self.topic1, 1) && slot(&self.topic2, 2) && slot(&self.topic3, 3)
    }
}

// ─── Factory ─────────────────────────────────────────────────────────────────

/// A factory-derived source: child addresses are extracted at runtime from
/// the parent's creation events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorySpec {
    /// Parent (factory) contract address, lowercase.
    pub address: String,
    /// Name of the creation event on the parent ABI.
    pub event: String,
    /// Name of the creation-event parameter holding the child address.
    pub parameter: String,
}

// ─── Source ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum SourceKind {
    /// Fixed address set.
    Static { addresses: Vec<String> },
    /// Address set derived from a parent's creation events.
    Factory(FactorySpec),
}

/// A logical event source bound to one network.
#[derive(Debug, Clone)]
pub struct EventSource {
    pub name: String,
    /// Name of the network this source lives on.
    pub network: String,
    pub kind: SourceKind,
    /// Events to index, parsed from the configured ABI.
    pub abi: EventAbi,
    pub topics: Option<TopicFilter>,
    pub start_block: u64,
    pub end_block: Option<u64>,
}

impl EventSource {
    /// Check the source invariants; called once at startup.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.abi.is_empty() {
            return Err(EngineError::Config(format!(
                "source `{}` has no events in its ABI",
                self.name
            )));
        }
        if let Some(end) = self.end_block {
            if end < self.start_block {
                return Err(EngineError::Config(format!(
                    "source `{}`: end block {} precedes start block {}",
                    self.name, end, self.start_block
                )));
            }
        }
        let addresses: Vec<&String> = match &self.kind {
            SourceKind::Static { addresses } => addresses.iter().collect(),
            SourceKind::Factory(spec) => vec![&spec.address],
        };
        for addr in addresses {
            if !is_address(addr) {
                return Err(EngineError::Config(format!(
                    "source `{}`: `{addr}` is not a lowercase 20-byte address",
                    self.name
                )));
            }
        }
        if let SourceKind::Factory(spec) = &self.kind {
            let schema = self.abi.event_by_name(&spec.event).ok_or_else(|| {
                EngineError::Config(format!(
                    "source `{}`: factory event `{}` not in ABI",
                    self.name, spec.event
                ))
            })?;
            // Resolves to exactly one child-address location, or errors.
            schema.child_location(&spec.parameter)?;
        }
        Ok(())
    }

    /// Stable fingerprint of this source's filter criteria. Keys the cache:
    /// two sources with the same fingerprint share synced intervals.
    ///
    /// For factories, `child_version` folds the materialized child set in,
    /// so a grown child set reads as a distinct coverage key.
    pub fn fingerprint(&self, child_version: u64) -> SourceFingerprint {
        let mut preimage = String::new();
        match &self.kind {
            SourceKind::Static { addresses } => {
                let mut sorted = addresses.clone();
                sorted.sort();
                preimage.push_str("static:");
                for addr in &sorted {
                    preimage.push_str(addr);
                    preimage.push(',');
                }
            }
            SourceKind::Factory(spec) => {
                preimage.push_str("factory:");
                preimage.push_str(&spec.address);
                preimage.push(':');
                preimage.push_str(&spec.event);
                preimage.push(':');
                preimage.push_str(&spec.parameter);
                preimage.push(':');
                preimage.push_str(&child_version.to_string());
            }
        }
        preimage.push('|');
        for selector in self.abi.selectors() {
            preimage.push_str(&selector);
            preimage.push(',');
        }
        if let Some(topics) = &self.topics {
            preimage.push('|');
            preimage.push_str(&serde_json::to_string(topics).unwrap_or_default());
        }
        SourceFingerprint::from_preimage(&preimage)
    }
}

/// Returns `true` for a lowercase `0x` + 40 hex char address.
pub fn is_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s[2..]
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

// ─── Fingerprint ─────────────────────────────────────────────────────────────

/// Stable identifier of a source's filter criteria; keys cached intervals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceFingerprint(String);

impl SourceFingerprint {
    /// Keccak of the canonical criteria string, truncated to 16 hex chars.
    fn from_preimage(preimage: &str) -> Self {
        let digest = keccak256(preimage.as_bytes());
        Self(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(addresses: Vec<&str>) -> EventSource {
        EventSource {
            name: "Token".into(),
            network: "mainnet".into(),
            kind: SourceKind::Static {
                addresses: addresses.into_iter().map(String::from).collect(),
            },
            abi: EventAbi::from_signatures(&[
                "Transfer(address indexed from, address indexed to, uint256 value)",
            ])
            .unwrap(),
            topics: None,
            start_block: 0,
            end_block: None,
        }
    }

    const ADDR_A: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const ADDR_B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[test]
    fn fingerprint_stable_and_order_insensitive() {
        let a = source(vec![ADDR_A, ADDR_B]).fingerprint(0);
        let b = source(vec![ADDR_B, ADDR_A]).fingerprint(0);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn fingerprint_differs_by_address_set() {
        let a = source(vec![ADDR_A]).fingerprint(0);
        let b = source(vec![ADDR_B]).fingerprint(0);
        assert_ne!(a, b);
    }

    #[test]
    fn factory_fingerprint_changes_with_child_version() {
        let mut src = source(vec![]);
        src.kind = SourceKind::Factory(FactorySpec {
            address: ADDR_A.into(),
            event: "Transfer".into(),
            parameter: "to".into(),
        });
        assert_ne!(src.fingerprint(0), src.fingerprint(1));
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let mut src = source(vec![ADDR_A]);
        src.start_block = 100;
        src.end_block = Some(50);
        assert!(matches!(src.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn validate_rejects_bad_address() {
        let src = source(vec!["0xNotAnAddress"]);
        assert!(src.validate().is_err());
        let src = source(vec!["0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"]); // uppercase
        assert!(src.validate().is_err());
    }

    #[test]
    fn validate_accepts_factory_with_indexed_child() {
        let mut src = source(vec![]);
        src.abi = EventAbi::from_signatures(&["ChildCreated(address indexed child)"]).unwrap();
        src.kind = SourceKind::Factory(FactorySpec {
            address: ADDR_A.into(),
            event: "ChildCreated".into(),
            parameter: "child".into(),
        });
        assert!(src.validate().is_ok());
    }

    #[test]
    fn topic_filter_matches() {
        let filter = TopicFilter {
            topic1: Some(vec![
                "0x000000000000000000000000000000000000000000000000000000000000000a".into(),
            ]),
            topic2: None,
            topic3: None,
        };
        let topics = vec![
            "0xselector".to_string(),
            "0x000000000000000000000000000000000000000000000000000000000000000A".to_string(),
        ];
        assert!(filter.matches(&topics));
        assert!(!filter.matches(&["0xselector".to_string()]));
    }
}
