//! The dispatcher — invokes user handlers in stream order, one at a
//! time, committing store mutations and the source checkpoint together.
//!
//! Handler failure is fatal by default; a handler may declare a bounded
//! retry budget and the same event is re-delivered with a fresh
//! transaction. A rollback marker rewinds the record store from its
//! inverse log and resets the affected checkpoints before any event from
//! the new branch is processed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use chainfeed_cache::CacheStore;
use chainfeed_core::{Checkpoint, EngineError, IndexedEvent};

use crate::context::{ContractInfo, ContractReader, HandlerContext, NetworkInfo};
use crate::stats::{HealthTracker, StatsObserver};
use crate::store::{EventPosition, RecordStore};
use crate::stream::StreamItem;

// ─── Handler traits ──────────────────────────────────────────────────────────

/// A user event handler, registered for one `(source, event)` pair.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// The source name this handler listens to (e.g. `"Token"`).
    fn source(&self) -> &str;

    /// The event name this handler listens to (e.g. `"Transfer"`).
    fn event(&self) -> &str;

    async fn handle(
        &self,
        event: &IndexedEvent,
        ctx: &mut HandlerContext<'_, '_>,
    ) -> Result<(), EngineError>;

    /// How many times a failed delivery is retried before it is fatal.
    fn max_retries(&self) -> u32 {
        0
    }
}

/// Runs once per source before its first event, in its own transaction.
/// Advances no checkpoint.
#[async_trait]
pub trait SetupHandler: Send + Sync {
    fn source(&self) -> &str;

    async fn setup(&self, ctx: &mut HandlerContext<'_, '_>) -> Result<(), EngineError>;
}

/// Registry of event and setup handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    event_handlers: HashMap<(String, String), Vec<Arc<dyn EventHandler>>>,
    setup_handlers: HashMap<String, Vec<Arc<dyn SetupHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(&mut self, handler: Arc<dyn EventHandler>) {
        self.event_handlers
            .entry((handler.source().to_string(), handler.event().to_string()))
            .or_default()
            .push(handler);
    }

    pub fn on_setup(&mut self, handler: Arc<dyn SetupHandler>) {
        self.setup_handlers
            .entry(handler.source().to_string())
            .or_default()
            .push(handler);
    }

    fn handlers_for(&self, source: &str, event: &str) -> &[Arc<dyn EventHandler>] {
        self.event_handlers
            .get(&(source.to_string(), event.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn setups_for(&self, source: &str) -> &[Arc<dyn SetupHandler>] {
        self.setup_handlers
            .get(source)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

/// Single-tasked event dispatch against the record store.
pub struct Dispatcher {
    registry: HandlerRegistry,
    store: Arc<RecordStore>,
    cache: Arc<dyn CacheStore>,
    readers: HashMap<u64, Arc<ContractReader>>,
    networks: HashMap<u64, NetworkInfo>,
    contracts: Arc<HashMap<String, ContractInfo>>,
    /// `(source name, chain id)` for checkpoint resets on rollback.
    sources: Vec<(String, u64)>,
    checkpoints: HashMap<String, Checkpoint>,
    setup_done: HashSet<String>,
    stats: Arc<StatsObserver>,
    health: Arc<HealthTracker>,
    in_rx: mpsc::Receiver<StreamItem>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: HandlerRegistry,
        store: Arc<RecordStore>,
        cache: Arc<dyn CacheStore>,
        readers: HashMap<u64, Arc<ContractReader>>,
        networks: HashMap<u64, NetworkInfo>,
        contracts: Arc<HashMap<String, ContractInfo>>,
        sources: Vec<(String, u64)>,
        checkpoints: HashMap<String, Checkpoint>,
        stats: Arc<StatsObserver>,
        health: Arc<HealthTracker>,
        in_rx: mpsc::Receiver<StreamItem>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            store,
            cache,
            readers,
            networks,
            contracts,
            sources,
            checkpoints,
            setup_done: HashSet::new(),
            stats,
            health,
            in_rx,
            shutdown,
        }
    }

    /// Process stream items until the stream closes or shutdown.
    ///
    /// At most one handler runs at any moment; the select only races
    /// shutdown against *receiving* the next item, never against an
    /// in-flight handler, so shutdown always lands on a commit boundary.
    pub async fn run(mut self) -> Result<(), EngineError> {
        let mut shutdown = self.shutdown.clone();
        loop {
            let item = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                item = self.in_rx.recv() => item,
            };
            match item {
                None => {
                    info!("event stream ended, dispatcher exiting");
                    return Ok(());
                }
                Some(StreamItem::Event(event)) => self.dispatch(event).await?,
                Some(StreamItem::Reorg {
                    chain_id,
                    from_block,
                }) => self.rollback(chain_id, from_block).await?,
            }
        }
    }

    async fn dispatch(&mut self, event: IndexedEvent) -> Result<(), EngineError> {
        self.ensure_setup(&event.source_name, event.chain_id).await?;

        // The stream enforces the floor; this is the dispatcher's own
        // monotonicity guarantee across restarts.
        if let Some(cp) = self.checkpoints.get(&event.source_name) {
            if cp.covers(event.block.number, event.log.log_index) {
                return Ok(());
            }
        }

        let handlers: Vec<Arc<dyn EventHandler>> = self
            .registry
            .handlers_for(&event.source_name, &event.event_name)
            .to_vec();
        let max_retries = handlers.iter().map(|h| h.max_retries()).max().unwrap_or(0);
        let position = EventPosition {
            chain_id: event.chain_id,
            block_number: event.block.number,
            log_index: event.log.log_index,
        };

        let mut attempts = 0u32;
        loop {
            let mut txn = self.store.begin(Some(position));
            let result = {
                let reader = self.readers.get(&event.chain_id).ok_or_else(|| {
                    EngineError::Config(format!("no gateway for chain {}", event.chain_id))
                })?;
                let network = self.networks.get(&event.chain_id).cloned().ok_or_else(|| {
                    EngineError::Config(format!("no network for chain {}", event.chain_id))
                })?;
                let mut ctx = HandlerContext {
                    db: &mut txn,
                    client: reader.as_ref(),
                    network,
                    contracts: &self.contracts,
                };
                let mut result = Ok(());
                for handler in &handlers {
                    result = handler.handle(&event, &mut ctx).await;
                    if result.is_err() {
                        break;
                    }
                }
                result
            };

            match result {
                Ok(()) => {
                    // Commit mutations and checkpoint as one unit: the
                    // WAL entries and the checkpoint row refer to the
                    // same position.
                    txn.commit();
                    let checkpoint = Checkpoint {
                        chain_id: event.chain_id,
                        source_name: event.source_name.clone(),
                        block_number: event.block.number,
                        log_index: event.log.log_index,
                        updated_at: chrono::Utc::now().timestamp(),
                    };
                    self.cache
                        .save_checkpoint(&checkpoint)
                        .await
                        .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
                    self.checkpoints
                        .insert(event.source_name.clone(), checkpoint);
                    self.stats.event_dispatched();
                    self.health
                        .observe_processed(event.chain_id, event.block.number);
                    return Ok(());
                }
                Err(e) => {
                    txn.abort();
                    attempts += 1;
                    if attempts > max_retries {
                        error!(
                            source = %event.source_name,
                            event = %event.event_name,
                            block = event.block.number,
                            error = %e,
                            "handler failed, aborting"
                        );
                        return Err(EngineError::Handler {
                            source_name: event.source_name.clone(),
                            event: event.event_name.clone(),
                            reason: e.to_string(),
                        });
                    }
                    warn!(
                        source = %event.source_name,
                        event = %event.event_name,
                        attempts,
                        max_retries,
                        error = %e,
                        "handler failed, retrying"
                    );
                }
            }
        }
    }

    async fn ensure_setup(&mut self, source: &str, chain_id: u64) -> Result<(), EngineError> {
        if self.setup_done.contains(source) {
            return Ok(());
        }
        self.setup_done.insert(source.to_string());

        let setups: Vec<Arc<dyn SetupHandler>> = self.registry.setups_for(source).to_vec();
        if setups.is_empty() {
            return Ok(());
        }
        let reader = self.readers.get(&chain_id).ok_or_else(|| {
            EngineError::Config(format!("no gateway for chain {chain_id}"))
        })?;
        let network = self.networks.get(&chain_id).cloned().ok_or_else(|| {
            EngineError::Config(format!("no network for chain {chain_id}"))
        })?;

        // Setup runs in its own transaction and advances no checkpoint.
        let mut txn = self.store.begin(None);
        let mut ctx = HandlerContext {
            db: &mut txn,
            client: reader.as_ref(),
            network,
            contracts: &self.contracts,
        };
        for setup in &setups {
            setup.setup(&mut ctx).await.map_err(|e| EngineError::Handler {
                source_name: source.to_string(),
                event: "setup".into(),
                reason: e.to_string(),
            })?;
        }
        txn.commit();
        info!(source, "setup complete");
        Ok(())
    }

    /// Rewind the record store and checkpoints for a reorged chain.
    async fn rollback(&mut self, chain_id: u64, from_block: u64) -> Result<(), EngineError> {
        warn!(chain_id, from_block, "rolling back dispatched state");
        self.store.rollback(chain_id, from_block);

        for (name, source_chain) in &self.sources {
            if *source_chain != chain_id {
                continue;
            }
            let Some(cp) = self.checkpoints.get_mut(name) else {
                continue;
            };
            if cp.block_number < from_block {
                continue;
            }
            if from_block == 0 {
                self.checkpoints.remove(name);
                self.cache
                    .delete_checkpoint(chain_id, name)
                    .await
                    .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
                continue;
            }
            // Everything through from_block - 1 was dispatched in order,
            // so the reset checkpoint still covers that whole block.
            cp.block_number = from_block - 1;
            cp.log_index = u32::MAX;
            cp.updated_at = chrono::Utc::now().timestamp();
            let cp = cp.clone();
            self.cache
                .save_checkpoint(&cp)
                .await
                .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
        }
        Ok(())
    }
}
