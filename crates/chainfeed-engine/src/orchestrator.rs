//! The orchestrator — wires gateways, cache, resolver, fetchers, stream,
//! and dispatcher into a running engine.
//!
//! Startup order matters: followers start first (their deliveries queue
//! while history drains, so no block is missed), then every source's
//! historical range is backfilled, then the stream merges history and
//! unpauses live delivery by reaching the end of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use chainfeed_cache::{CacheStore, SqliteCache};
use chainfeed_core::{EngineError, EventSource, Network, SourceKind};
use chainfeed_rpc::{
    FallbackTransport, GatewayConfig, HttpTransport, RpcGateway, RpcTransport, WsConfig,
    WsTransport,
};

use crate::config::{Config, DatabaseConfig, TransportConfig};
use crate::context::{ContractInfo, ContractReader, NetworkInfo};
use crate::dispatcher::{Dispatcher, HandlerRegistry};
use crate::follower::{LiveDelivery, LiveFollower};
use crate::historical::HistoricalFetcher;
use crate::resolver::SourceResolver;
use crate::stats::{HealthTracker, NetworkHealth, StatsObserver};
use crate::store::RecordStore;
use crate::stream::{EventStream, SourceSpec, StreamItem};

/// Capacity of the stream → dispatcher channel; the stream blocks when
/// the dispatcher falls this far behind.
const DISPATCH_BUFFER: usize = 1_024;

/// Builds and launches the pipeline.
pub struct Orchestrator {
    config: Config,
    registry: HandlerRegistry,
    transports: HashMap<String, Arc<dyn RpcTransport>>,
    cache: Option<Arc<dyn CacheStore>>,
}

impl Orchestrator {
    pub fn new(config: Config, registry: HandlerRegistry) -> Self {
        Self {
            config,
            registry,
            transports: HashMap::new(),
            cache: None,
        }
    }

    /// Use a pre-built transport for a network instead of constructing
    /// one from configuration. Tests inject scripted transports here.
    pub fn with_transport(mut self, network: &str, transport: Arc<dyn RpcTransport>) -> Self {
        self.transports.insert(network.to_string(), transport);
        self
    }

    /// Use a pre-built cache store.
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Start everything. Returns once historical backfill has drained
    /// into the dispatcher pipeline and live following is underway.
    pub async fn launch(mut self) -> Result<Engine, EngineError> {
        let networks = self.config.networks();
        let sources = self.config.sources()?;
        if networks.is_empty() || sources.is_empty() {
            return Err(EngineError::Config(
                "at least one network and one contract are required".into(),
            ));
        }

        let cache = match self.cache.take() {
            Some(cache) => cache,
            None => open_cache(&self.config).await?,
        };
        let resolver = Arc::new(SourceResolver::new(cache.clone()));
        let stats = Arc::new(StatsObserver::new());
        let health = Arc::new(HealthTracker::new());
        let store = Arc::new(RecordStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = mpsc::channel::<EngineError>(1);

        // The in-process record store starts empty on every run, so
        // dispatch restarts from the beginning of each source; stale
        // checkpoints must not suppress the replay.
        for source in &sources {
            let network = network_of(&networks, &source.network)?;
            cache
                .delete_checkpoint(network.chain_id, &source.name)
                .await
                .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
        }

        // Gateways and per-chain handler plumbing.
        let mut gateways: HashMap<String, Arc<RpcGateway>> = HashMap::new();
        let mut readers: HashMap<u64, Arc<ContractReader>> = HashMap::new();
        let mut network_infos: HashMap<u64, NetworkInfo> = HashMap::new();
        for network in &networks {
            let transport = match self.transports.get(&network.name) {
                Some(t) => t.clone(),
                None => build_transport(&self.config.transport_for(&network.name)?)?,
            };
            let gateway = Arc::new(RpcGateway::new(
                network.name.clone(),
                network.chain_id,
                transport,
                GatewayConfig {
                    max_concurrency: network.max_task_concurrency,
                    ..GatewayConfig::default()
                },
            ));
            readers.insert(network.chain_id, Arc::new(ContractReader::new(gateway.clone())));
            network_infos.insert(
                network.chain_id,
                NetworkInfo {
                    name: network.name.clone(),
                    chain_id: network.chain_id,
                },
            );
            gateways.insert(network.name.clone(), gateway);
        }

        // Followers first: they queue deliveries from the moment the
        // historical tip is pinned, so nothing between backfill end and
        // live start is missed.
        let (live_tx, live_rx) = mpsc::unbounded_channel::<LiveDelivery>();
        let mut aux: Vec<JoinHandle<()>> = Vec::new();
        let mut live_starts: HashMap<String, u64> = HashMap::new();
        for network in &networks {
            let gateway = gateways[&network.name].clone();
            let tip = gateway.block_number().await?;
            let live_start = network.finalized_block(tip) + 1;
            live_starts.insert(network.name.clone(), live_start);
            if let Some(reader) = readers.get(&network.chain_id) {
                reader.set_finalized(network.finalized_block(tip));
            }

            // A network whose sources are all bounded below the live
            // range needs no follower; with none running, the stream
            // drains history and ends, and the engine exits cleanly.
            let needs_follower = sources.iter().any(|s| {
                s.network == network.name && s.end_block.map_or(true, |end| end >= live_start)
            });
            if !needs_follower {
                info!(network = %network.name, "all sources bounded, skipping live follower");
                continue;
            }

            let follower = LiveFollower::new(
                gateway,
                cache.clone(),
                network.clone(),
                resolver.clone(),
                sources
                    .iter()
                    .filter(|s| s.network == network.name)
                    .cloned()
                    .collect(),
                live_tx.clone(),
                stats.clone(),
                health.clone(),
                shutdown_rx.clone(),
            );
            let fatal = fatal_tx.clone();
            let name = network.name.clone();
            aux.push(tokio::spawn(async move {
                match follower.run(live_start).await {
                    Ok(()) | Err(EngineError::Aborted(_)) => {}
                    Err(e) => {
                        error!(network = %name, error = %e, "live follower failed");
                        let _ = fatal.send(e).await;
                    }
                }
            }));
        }
        drop(live_tx);

        // Historical backfill, per source, bounded per network by the
        // gateway's concurrency cap.
        let mut specs: Vec<SourceSpec> = Vec::new();
        for source in &sources {
            let network = network_of(&networks, &source.network)?;
            let fetcher = HistoricalFetcher::new(
                gateways[&network.name].clone(),
                cache.clone(),
                network.clone(),
                stats.clone(),
                shutdown_rx.clone(),
            );
            let block_range = self.config.block_range_for(source, &network);
            let sync_end = fetcher.sync_source(&resolver, source, block_range).await?;
            // Live delivery begins where this source's history ends; a
            // later tip during backfill only widens history, never gaps.
            let historical_end = sync_end.max(live_starts[&network.name].saturating_sub(1));
            specs.push(SourceSpec {
                source: source.clone(),
                chain_id: network.chain_id,
                historical_end,
            });
        }
        info!(sources = specs.len(), "historical backfill complete");

        // Seed stream floors from persisted checkpoints (empty after the
        // reset above; populated when an external store carries state
        // across runs).
        let mut floors = HashMap::new();
        let mut checkpoints = HashMap::new();
        for spec in &specs {
            if let Some(cp) = cache
                .load_checkpoint(spec.chain_id, &spec.source.name)
                .await
                .map_err(|e| EngineError::CacheWrite(e.to_string()))?
            {
                floors.insert(spec.source.name.clone(), (cp.block_number, cp.log_index));
                checkpoints.insert(spec.source.name.clone(), cp);
            }
        }

        let (stream_tx, stream_rx) = mpsc::channel::<StreamItem>(DISPATCH_BUFFER);
        let stream = EventStream::new(
            cache.clone(),
            resolver.clone(),
            specs.clone(),
            live_rx,
            stream_tx,
            floors,
            shutdown_rx.clone(),
        );
        let fatal = fatal_tx.clone();
        aux.push(tokio::spawn(async move {
            match stream.run().await {
                Ok(()) | Err(EngineError::Aborted(_)) => {}
                Err(e) => {
                    error!(error = %e, "event stream failed");
                    let _ = fatal.send(e).await;
                }
            }
        }));

        let dispatcher = Dispatcher::new(
            self.registry,
            store.clone(),
            cache.clone(),
            readers,
            network_infos,
            Arc::new(contract_infos(&sources)),
            specs
                .iter()
                .map(|s| (s.source.name.clone(), s.chain_id))
                .collect(),
            checkpoints,
            stats.clone(),
            health.clone(),
            stream_rx,
            shutdown_rx,
        );
        let dispatcher = tokio::spawn(dispatcher.run());

        Ok(Engine {
            shutdown: shutdown_tx,
            health,
            stats,
            store,
            max_healthcheck_lag: self.config.options.max_healthcheck_lag,
            dispatcher,
            fatal_rx,
            aux,
        })
    }
}

/// A running pipeline.
pub struct Engine {
    shutdown: watch::Sender<bool>,
    health: Arc<HealthTracker>,
    stats: Arc<StatsObserver>,
    store: Arc<RecordStore>,
    max_healthcheck_lag: u64,
    dispatcher: JoinHandle<Result<(), EngineError>>,
    fatal_rx: mpsc::Receiver<EngineError>,
    aux: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Per-network health lines for the health endpoint.
    pub fn health(&self) -> Vec<NetworkHealth> {
        self.health.report(self.max_healthcheck_lag)
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy(self.max_healthcheck_lag)
    }

    pub fn stats(&self) -> &StatsObserver {
        &self.stats
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Run until the dispatcher exits or a stage fails. Returns the
    /// process exit code: 0 clean, 1 config/handler error, 2 RPC
    /// permanently unavailable.
    pub async fn wait(mut self) -> i32 {
        let code = tokio::select! {
            result = &mut self.dispatcher => match result {
                Ok(Ok(())) => 0,
                Ok(Err(e)) => {
                    error!(error = %e, "dispatcher failed");
                    e.exit_code()
                }
                Err(join) => {
                    error!(error = %join, "dispatcher panicked");
                    1
                }
            },
            Some(e) = self.fatal_rx.recv() => {
                let _ = self.shutdown.send(true);
                let _ = (&mut self.dispatcher).await;
                e.exit_code()
            }
        };
        for handle in &self.aux {
            handle.abort();
        }
        code
    }

    /// Ordered shutdown: stop enqueueing, drain to a checkpoint, commit,
    /// exit. Returns the exit code.
    pub async fn shutdown(mut self) -> i32 {
        let _ = self.shutdown.send(true);
        let code = match (&mut self.dispatcher).await {
            Ok(Ok(())) => 0,
            Ok(Err(e)) => e.exit_code(),
            Err(_) => 1,
        };
        for handle in self.aux.drain(..) {
            let _ = handle.await;
        }
        code
    }
}

// ─── Construction helpers ────────────────────────────────────────────────────

fn network_of(networks: &[Network], name: &str) -> Result<Network, EngineError> {
    networks
        .iter()
        .find(|n| n.name == name)
        .cloned()
        .ok_or_else(|| EngineError::Config(format!("unknown network `{name}`")))
}

fn build_transport(config: &TransportConfig) -> Result<Arc<dyn RpcTransport>, EngineError> {
    match config {
        TransportConfig::Http { url } => {
            let transport = HttpTransport::new(url, Duration::from_secs(30))
                .map_err(|e| EngineError::Config(format!("http transport: {e}")))?;
            Ok(Arc::new(transport))
        }
        TransportConfig::Ws { url } => {
            Ok(Arc::new(WsTransport::connect(url, WsConfig::default())))
        }
        TransportConfig::Fallback { transports } => {
            let built = transports
                .iter()
                .map(build_transport)
                .collect::<Result<Vec<_>, _>>()?;
            if built.is_empty() {
                return Err(EngineError::Config("empty fallback transport list".into()));
            }
            Ok(Arc::new(FallbackTransport::new(built)))
        }
    }
}

async fn open_cache(config: &Config) -> Result<Arc<dyn CacheStore>, EngineError> {
    match config.database() {
        DatabaseConfig::Sqlite { filename } => {
            if let Some(parent) = std::path::Path::new(&filename).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| EngineError::Config(format!("cache dir: {e}")))?;
                }
            }
            let cache = SqliteCache::open(&filename)
                .await
                .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
            Ok(Arc::new(cache))
        }
        #[cfg(feature = "postgres")]
        DatabaseConfig::Postgres { connection_string } => {
            let cache = chainfeed_cache::PostgresCache::connect(&connection_string)
                .await
                .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
            Ok(Arc::new(cache))
        }
        #[cfg(not(feature = "postgres"))]
        DatabaseConfig::Postgres { .. } => Err(EngineError::Config(
            "postgres support not compiled in (enable the `postgres` feature)".into(),
        )),
    }
}

fn contract_infos(sources: &[EventSource]) -> HashMap<String, ContractInfo> {
    let mut infos = HashMap::new();
    for source in sources {
        let address = match &source.kind {
            SourceKind::Static { addresses } => addresses.first().cloned(),
            SourceKind::Factory(spec) => Some(spec.address.clone()),
        };
        infos.insert(
            source.name.clone(),
            ContractInfo {
                abi: source.abi.clone(),
                address,
                start_block: source.start_block,
                end_block: source.end_block,
            },
        );
    }
    infos
}
