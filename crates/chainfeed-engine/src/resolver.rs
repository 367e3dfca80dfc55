//! Source resolution: from a configured source to the concrete address
//! set and log filter the fetchers use.
//!
//! Static sources pass through. Factory sources first need the parent's
//! creation events synced (the historical fetcher handles that through a
//! synthetic static source), then the child address set is materialized
//! from cached parent logs and re-read before every range slice, because
//! it grows as new children are discovered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use chainfeed_cache::CacheStore;
use chainfeed_core::{
    abi::extract_child_address, BlockInterval, EngineError, EventSource, SourceFingerprint,
    SourceKind, TopicFilter,
};

/// The effective filter for one source at one point in time.
#[derive(Debug, Clone)]
pub struct ResolvedFilter {
    pub addresses: Vec<String>,
    /// topic0 values: the source ABI's event selectors.
    pub selectors: Vec<String>,
    pub topics: Option<TopicFilter>,
    pub start_block: u64,
    pub end_block: Option<u64>,
    pub fingerprint: SourceFingerprint,
}

/// The materialized child set of one factory source.
#[derive(Debug, Default, Clone)]
struct ChildSet {
    /// Children in discovery order.
    addresses: Vec<String>,
    /// Block at which each child's creation event appeared.
    discovery_blocks: HashMap<String, u64>,
    /// Bumped whenever the set grows; folded into the fingerprint.
    version: u64,
}

/// Resolves configured sources into fetchable filters; holds the factory
/// child sets materialized from the cache.
pub struct SourceResolver {
    cache: Arc<dyn CacheStore>,
    children: Mutex<HashMap<String, ChildSet>>,
}

impl SourceResolver {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            cache,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// The synthetic static source covering a factory's creation events:
    /// the parent contract with only the creation event's selector.
    pub fn synthetic_parent(source: &EventSource) -> Result<EventSource, EngineError> {
        let spec = match &source.kind {
            SourceKind::Factory(spec) => spec,
            SourceKind::Static { .. } => {
                return Err(EngineError::Config(format!(
                    "source `{}` is not a factory",
                    source.name
                )))
            }
        };
        Ok(EventSource {
            name: format!("{}:factory", source.name),
            network: source.network.clone(),
            kind: SourceKind::Static {
                addresses: vec![spec.address.clone()],
            },
            abi: source.abi.clone(),
            topics: None,
            start_block: source.start_block,
            end_block: source.end_block,
        })
    }

    /// Scan cached parent logs up to `upto_block` and fold newly found
    /// children into the set. Returns the number of known children.
    ///
    /// On growth, interval coverage recorded under the previous child-set
    /// version is carried forward truncated at the new members' discovery
    /// block, so only the uncovered tail is refetched.
    pub async fn materialize_children(
        &self,
        source: &EventSource,
        chain_id: u64,
        upto_block: u64,
    ) -> Result<usize, EngineError> {
        let spec = match &source.kind {
            SourceKind::Factory(spec) => spec,
            SourceKind::Static { .. } => return Ok(0),
        };
        let schema = source.abi.event_by_name(&spec.event).ok_or_else(|| {
            EngineError::Config(format!(
                "source `{}`: factory event `{}` not in ABI",
                source.name, spec.event
            ))
        })?;
        let location = schema.child_location(&spec.parameter)?;
        let selector = schema.selector();

        let parent_logs = self
            .cache
            .logs_matching(
                chain_id,
                BlockInterval::new(source.start_block, upto_block),
                std::slice::from_ref(&spec.address),
                &[selector],
            )
            .await
            .map_err(|e| EngineError::CacheWrite(e.to_string()))?;

        let mut discovered: Vec<(String, u64)> = Vec::new();
        for log in &parent_logs {
            let child = extract_child_address(log, location)?;
            discovered.push((child, log.block_number));
        }

        let (old_fingerprint, new_members) = {
            let mut children = self.children.lock().unwrap();
            let set = children.entry(source.name.clone()).or_default();
            let old_fingerprint = source.fingerprint(set.version);

            let mut new_members: Vec<(String, u64)> = Vec::new();
            for (child, block) in discovered {
                if !set.discovery_blocks.contains_key(&child) {
                    set.discovery_blocks.insert(child.clone(), block);
                    set.addresses.push(child.clone());
                    new_members.push((child, block));
                }
            }
            if !new_members.is_empty() {
                set.version += 1;
                info!(
                    source = %source.name,
                    new = new_members.len(),
                    total = set.addresses.len(),
                    "factory children discovered"
                );
            }
            (old_fingerprint, new_members)
        };

        if let Some(min_discovery) = new_members.iter().map(|(_, b)| *b).min() {
            self.carry_intervals(source, chain_id, &old_fingerprint, min_discovery)
                .await?;
        }

        Ok(self.child_count(source))
    }

    /// Copy interval coverage from the previous fingerprint, truncated
    /// below the earliest new child's discovery block.
    async fn carry_intervals(
        &self,
        source: &EventSource,
        chain_id: u64,
        old_fingerprint: &SourceFingerprint,
        min_discovery: u64,
    ) -> Result<(), EngineError> {
        if min_discovery == 0 {
            return Ok(());
        }
        let new_fingerprint = self.fingerprint(source);
        let mut carried = self
            .cache
            .cached_intervals(chain_id, old_fingerprint)
            .await
            .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
        carried.truncate_at(min_discovery);
        for iv in carried.as_slice() {
            self.cache
                .record_interval(chain_id, &new_fingerprint, *iv)
                .await
                .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
        }
        debug!(
            source = %source.name,
            below = min_discovery,
            "carried interval coverage across child-set growth"
        );
        Ok(())
    }

    /// The current fingerprint (folds in the child-set version for
    /// factories).
    pub fn fingerprint(&self, source: &EventSource) -> SourceFingerprint {
        let version = match &source.kind {
            SourceKind::Static { .. } => 0,
            SourceKind::Factory(_) => self
                .children
                .lock()
                .unwrap()
                .get(&source.name)
                .map(|s| s.version)
                .unwrap_or(0),
        };
        source.fingerprint(version)
    }

    /// Resolve a source to its current effective filter. For factories
    /// the address set reflects the children materialized so far; callers
    /// re-resolve before each range slice.
    pub fn resolve(&self, source: &EventSource) -> ResolvedFilter {
        let addresses = match &source.kind {
            SourceKind::Static { addresses } => addresses.clone(),
            SourceKind::Factory(_) => self
                .children
                .lock()
                .unwrap()
                .get(&source.name)
                .map(|s| s.addresses.clone())
                .unwrap_or_default(),
        };
        ResolvedFilter {
            addresses,
            selectors: source.abi.selectors(),
            topics: source.topics.clone(),
            start_block: source.start_block,
            end_block: source.end_block,
            fingerprint: self.fingerprint(source),
        }
    }

    /// Record a child discovered from a live parent log. Coverage
    /// recorded under the previous child-set version is carried forward
    /// truncated at the child's discovery block, the same transition
    /// `materialize_children` performs for backfill growth. Returns
    /// `true` if the child is new.
    pub async fn note_child(
        &self,
        source: &EventSource,
        chain_id: u64,
        address: String,
        block: u64,
    ) -> Result<bool, EngineError> {
        let old_fingerprint = {
            let mut children = self.children.lock().unwrap();
            let set = children.entry(source.name.clone()).or_default();
            if set.discovery_blocks.contains_key(&address) {
                return Ok(false);
            }
            let old_fingerprint = source.fingerprint(set.version);
            info!(source = %source.name, child = %address, block, "factory child discovered live");
            set.discovery_blocks.insert(address.clone(), block);
            set.addresses.push(address);
            set.version += 1;
            old_fingerprint
        };
        self.carry_intervals(source, chain_id, &old_fingerprint, block)
            .await?;
        Ok(true)
    }

    pub fn child_count(&self, source: &EventSource) -> usize {
        self.children
            .lock()
            .unwrap()
            .get(&source.name)
            .map(|s| s.addresses.len())
            .unwrap_or(0)
    }

    /// The block a factory child was discovered at; events from the child
    /// below this block are not part of the source.
    pub fn child_discovery_block(&self, source_name: &str, address: &str) -> Option<u64> {
        self.children
            .lock()
            .unwrap()
            .get(source_name)
            .and_then(|s| s.discovery_blocks.get(address).copied())
    }
}
