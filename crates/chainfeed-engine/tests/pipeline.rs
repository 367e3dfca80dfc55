//! End-to-end pipeline scenarios against a scripted chain.
//!
//! A `MockChain` implements the RPC transport and serves a deterministic
//! chain: block hashes derive from `(number, branch)`, logs attach to a
//! `(block, branch)` pair, and tests mutate the canonical branch map to
//! stage reorgs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use chainfeed_cache::{CacheStore, SqliteCache};
use chainfeed_core::{EngineError, EventAbi, IndexedEvent};
use chainfeed_engine::{
    Config, EventHandler, HandlerContext, HandlerRegistry, Orchestrator,
};
use chainfeed_rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcTransport, TransportError};

// ─── MockChain ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MockLog {
    block: u64,
    log_index: u32,
    address: String,
    topics: Vec<String>,
    data: String,
    branch: char,
}

#[derive(Default)]
struct ChainState {
    tip: u64,
    /// Canonical branch per block number; unset means branch 'a'.
    branches: HashMap<u64, char>,
    timestamps: HashMap<u64, i64>,
    logs: Vec<MockLog>,
}

struct MockChain {
    state: Mutex<ChainState>,
    /// Reject `eth_getLogs` spans wider than this.
    max_range: Option<u64>,
    get_logs_ok: AtomicU32,
    get_logs_rejected: AtomicU32,
}

impl MockChain {
    fn new(tip: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChainState {
                tip,
                ..Default::default()
            }),
            max_range: None,
            get_logs_ok: AtomicU32::new(0),
            get_logs_rejected: AtomicU32::new(0),
        })
    }

    fn with_max_range(tip: u64, max_range: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChainState {
                tip,
                ..Default::default()
            }),
            max_range: Some(max_range),
            get_logs_ok: AtomicU32::new(0),
            get_logs_rejected: AtomicU32::new(0),
        })
    }

    fn add_log(&self, block: u64, log_index: u32, address: &str, topics: Vec<String>, data: &str) {
        self.add_branch_log(block, log_index, address, topics, data, 'a');
    }

    fn add_branch_log(
        &self,
        block: u64,
        log_index: u32,
        address: &str,
        topics: Vec<String>,
        data: &str,
        branch: char,
    ) {
        self.state.lock().unwrap().logs.push(MockLog {
            block,
            log_index,
            address: address.to_string(),
            topics,
            data: data.to_string(),
            branch,
        });
    }

    fn set_timestamp(&self, block: u64, timestamp: i64) {
        self.state.lock().unwrap().timestamps.insert(block, timestamp);
    }

    fn set_branch(&self, block: u64, branch: char) {
        self.state.lock().unwrap().branches.insert(block, branch);
    }

    fn set_tip(&self, tip: u64) {
        self.state.lock().unwrap().tip = tip;
    }

    fn logs_fetched(&self) -> u32 {
        self.get_logs_ok.load(Ordering::Relaxed)
    }
}

fn branch_of(state: &ChainState, number: u64) -> char {
    state.branches.get(&number).copied().unwrap_or('a')
}

fn hash_of(state: &ChainState, number: u64) -> String {
    format!("0x{}{:015x}", branch_of(state, number), number)
}

fn timestamp_of(state: &ChainState, number: u64) -> i64 {
    state
        .timestamps
        .get(&number)
        .copied()
        .unwrap_or((number * 12) as i64)
}

fn canonical_logs(state: &ChainState, number: u64) -> Vec<&MockLog> {
    let branch = branch_of(state, number);
    state
        .logs
        .iter()
        .filter(|l| l.block == number && l.branch == branch)
        .collect()
}

fn block_json(state: &ChainState, number: u64, hydrate: bool) -> Value {
    let parent = if number == 0 {
        "0x0".to_string()
    } else {
        hash_of(state, number - 1)
    };
    let transactions: Vec<Value> = if hydrate {
        canonical_logs(state, number)
            .iter()
            .map(|l| {
                json!({
                    "hash": format!("0xtx{:x}-{}", l.block, l.log_index),
                    "transactionIndex": "0x0",
                    "from": "0x00000000000000000000000000000000000000ee",
                    "to": l.address,
                    "value": "0x0",
                    "input": "0x",
                    "nonce": "0x0"
                })
            })
            .collect()
    } else {
        Vec::new()
    };
    json!({
        "hash": hash_of(state, number),
        "parentHash": parent,
        "number": format!("0x{number:x}"),
        "timestamp": format!("0x{:x}", timestamp_of(state, number)),
        "gasUsed": "0x0",
        "miner": "0x0000000000000000000000000000000000000000",
        "transactions": transactions
    })
}

fn log_json(state: &ChainState, log: &MockLog) -> Value {
    json!({
        "address": log.address,
        "topics": log.topics,
        "data": log.data,
        "blockNumber": format!("0x{:x}", log.block),
        "blockHash": hash_of(state, log.block),
        "transactionHash": format!("0xtx{:x}-{}", log.block, log.log_index),
        "transactionIndex": "0x0",
        "logIndex": format!("0x{:x}", log.log_index),
        "removed": false
    })
}

fn values_of(slot: &Value) -> Vec<String> {
    match slot {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl RpcTransport for MockChain {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let state = self.state.lock().unwrap();
        let result = match req.method.as_str() {
            "eth_blockNumber" => json!(format!("0x{:x}", state.tip)),
            "eth_getBlockByNumber" => {
                let number = u64::from_str_radix(
                    req.params[0].as_str().unwrap_or("0x0").trim_start_matches("0x"),
                    16,
                )
                .unwrap_or(0);
                let hydrate = req.params[1].as_bool().unwrap_or(false);
                if number > state.tip {
                    Value::Null
                } else {
                    block_json(&state, number, hydrate)
                }
            }
            "eth_getBlockByHash" => {
                let wanted = req.params[0].as_str().unwrap_or_default();
                let hydrate = req.params[1].as_bool().unwrap_or(false);
                (0..=state.tip)
                    .find(|n| hash_of(&state, *n) == wanted)
                    .map(|n| block_json(&state, n, hydrate))
                    .unwrap_or(Value::Null)
            }
            "eth_getLogs" => {
                let filter = &req.params[0];
                let from = u64::from_str_radix(
                    filter["fromBlock"].as_str().unwrap_or("0x0").trim_start_matches("0x"),
                    16,
                )
                .unwrap_or(0);
                let to = u64::from_str_radix(
                    filter["toBlock"].as_str().unwrap_or("0x0").trim_start_matches("0x"),
                    16,
                )
                .unwrap_or(0);
                if let Some(max) = self.max_range {
                    if to - from + 1 > max {
                        self.get_logs_rejected.fetch_add(1, Ordering::Relaxed);
                        return Ok(JsonRpcResponse {
                            jsonrpc: "2.0".into(),
                            id: req.id,
                            result: None,
                            error: Some(JsonRpcError {
                                code: -32005,
                                message: "block range too large".into(),
                                data: None,
                            }),
                        });
                    }
                }
                self.get_logs_ok.fetch_add(1, Ordering::Relaxed);
                let addresses = values_of(&filter["address"]);
                let topic0 = filter
                    .get("topics")
                    .and_then(|t| t.get(0))
                    .map(values_of)
                    .unwrap_or_default();
                let matched: Vec<Value> = (from..=to.min(state.tip))
                    .flat_map(|n| canonical_logs(&state, n).into_iter().cloned().collect::<Vec<_>>())
                    .filter(|l| {
                        (addresses.is_empty()
                            || addresses.iter().any(|a| a.eq_ignore_ascii_case(&l.address)))
                            && (topic0.is_empty()
                                || l.topics
                                    .first()
                                    .is_some_and(|t| topic0.iter().any(|s| s.eq_ignore_ascii_case(t))))
                    })
                    .map(|l| log_json(&state, &l))
                    .collect();
                Value::Array(matched)
            }
            other => {
                return Ok(JsonRpcResponse {
                    jsonrpc: "2.0".into(),
                    id: req.id,
                    result: None,
                    error: Some(JsonRpcError {
                        code: -32601,
                        message: format!("method not found: {other}"),
                        data: None,
                    }),
                })
            }
        };
        Ok(JsonRpcResponse::ok(req.id, result))
    }

    fn url(&self) -> &str {
        "mock"
    }
}

// ─── Test handlers ───────────────────────────────────────────────────────────

type DispatchLog = Arc<Mutex<Vec<(String, u64, u32)>>>;

/// Records every delivery and mirrors it into the record store.
struct Recorder {
    source: String,
    event: String,
    tag_field: Option<String>,
    seen: DispatchLog,
}

#[async_trait]
impl EventHandler for Recorder {
    fn source(&self) -> &str {
        &self.source
    }

    fn event(&self) -> &str {
        &self.event
    }

    async fn handle(
        &self,
        event: &IndexedEvent,
        ctx: &mut HandlerContext<'_, '_>,
    ) -> Result<(), EngineError> {
        let tag = match &self.tag_field {
            Some(field) => event.args[field].as_str().unwrap_or_default().to_string(),
            None => event.log.address.clone(),
        };
        self.seen
            .lock()
            .unwrap()
            .push((tag.clone(), event.block.number, event.log.log_index));
        let id = format!("{}-{}-{}", tag, event.block.number, event.log.log_index);
        ctx.db.create(
            "entries",
            &id,
            json!({
                "tag": tag,
                "block": event.block.number,
                "source": event.source_name,
            }),
        )?;
        Ok(())
    }
}

fn recorder(source: &str, event: &str, tag_field: Option<&str>, seen: &DispatchLog) -> Arc<Recorder> {
    Arc::new(Recorder {
        source: source.into(),
        event: event.into(),
        tag_field: tag_field.map(String::from),
        seen: seen.clone(),
    })
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

const TOKEN: &str = "0xabc0000000000000000000000000000000000001";
const FACTORY: &str = "0xfac0000000000000000000000000000000000001";
const CHILD_1: &str = "0xc10000000000000000000000000000000000c1c1";
const CHILD_2: &str = "0xc20000000000000000000000000000000000c2c2";

fn selector(signature_set: &[&str], event: &str) -> String {
    EventAbi::from_signatures(signature_set)
        .unwrap()
        .event_by_name(event)
        .unwrap()
        .selector()
}

fn word_u64(v: u64) -> String {
    format!("{v:064x}")
}

fn word_address(addr: &str) -> String {
    format!("{}{}", "0".repeat(24), addr.trim_start_matches("0x"))
}

fn e_abi_json() -> Value {
    json!([{
        "type": "event",
        "name": "E",
        "inputs": [
            {"name": "id", "type": "uint256"},
            {"name": "to", "type": "address"}
        ]
    }])
}

fn e_log_data(id: u64, to: &str) -> String {
    format!("0x{}{}", word_u64(id), word_address(to))
}

fn e_selector() -> String {
    selector(&["E(uint256 id, address to)"], "E")
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

fn single_network_config(
    finality_depth: u64,
    max_block_range: u64,
    contract: Value,
) -> Config {
    Config::from_json(
        &json!({
            "networks": {
                "testnet": {
                    "chain_id": 1,
                    "transport": {"kind": "http", "url": "http://unused.invalid"},
                    "finality_depth": finality_depth,
                    "polling_interval_ms": 25,
                    "max_block_range": max_block_range
                }
            },
            "contracts": { "Token": contract }
        })
        .to_string(),
    )
    .unwrap()
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

// One static source, three matching logs in final blocks: dispatch order
// follows block order and the checkpoint lands on the last event.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn static_source_dispatches_in_order() {
    let chain = MockChain::new(110);
    let sel = e_selector();
    chain.add_log(100, 0, TOKEN, vec![sel.clone()], &e_log_data(1, CHILD_1));
    chain.add_log(101, 0, TOKEN, vec![sel.clone()], &e_log_data(2, CHILD_1));
    chain.add_log(102, 0, TOKEN, vec![sel.clone()], &e_log_data(3, CHILD_1));

    let config = single_network_config(
        5,
        1_000,
        json!({
            "network": "testnet",
            "address": TOKEN,
            "start_block": 100,
            "abi": e_abi_json()
        }),
    );

    let seen: DispatchLog = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    registry.on_event(recorder("Token", "E", Some("id"), &seen));

    let cache = Arc::new(SqliteCache::in_memory().await.unwrap());
    let engine = Orchestrator::new(config, registry)
        .with_transport("testnet", chain.clone())
        .with_cache(cache.clone())
        .launch()
        .await
        .unwrap();

    wait_for(|| seen.lock().unwrap().len() == 3).await;
    let ids: Vec<String> = seen.lock().unwrap().iter().map(|(t, _, _)| t.clone()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);

    wait_for(|| {
        futures_block(cache.load_checkpoint(1, "Token"))
            .unwrap()
            .is_some_and(|cp| (cp.block_number, cp.log_index) == (102, 0))
    })
    .await;

    assert_eq!(engine.shutdown().await, 0);
}

// Provider rejects spans over 1024 blocks: the requested [0, 4095] is
// halved down to four slices and one merged interval covers it all.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn range_halving_converges() {
    let chain = MockChain::with_max_range(4200, 1024);
    let config = single_network_config(
        5,
        4_096,
        json!({
            "network": "testnet",
            "address": TOKEN,
            "start_block": 0,
            "end_block": 4095,
            "abi": e_abi_json()
        }),
    );

    let registry = HandlerRegistry::new();
    let cache = Arc::new(SqliteCache::in_memory().await.unwrap());
    let engine = Orchestrator::new(config, registry)
        .with_transport("testnet", chain.clone())
        .with_cache(cache.clone())
        .launch()
        .await
        .unwrap();
    // Bounded source, no follower: the pipeline drains and exits clean.
    assert_eq!(engine.wait().await, 0);

    assert_eq!(chain.logs_fetched(), 4);
    assert_eq!(chain.get_logs_rejected.load(Ordering::Relaxed), 3);

    let sources = single_network_config(
        5,
        4_096,
        json!({
            "network": "testnet",
            "address": TOKEN,
            "start_block": 0,
            "end_block": 4095,
            "abi": e_abi_json()
        }),
    )
    .sources()
    .unwrap();
    let fingerprint = sources[0].fingerprint(0);
    let set = futures_block(cache.cached_intervals(1, &fingerprint)).unwrap();
    assert_eq!(
        set.as_slice(),
        &[chainfeed_core::BlockInterval::new(0, 4095)]
    );
}

// Factory children: Ping events dispatch only from discovered children,
// and only from their discovery block on.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn factory_children_resolve_and_filter() {
    let chain = MockChain::new(110);
    let abi_set = &["ChildCreated(address indexed child)", "Ping()"];
    let created = selector(abi_set, "ChildCreated");
    let ping = selector(abi_set, "Ping");

    chain.add_log(
        50,
        0,
        FACTORY,
        vec![created.clone(), format!("0x{}", word_address(CHILD_1))],
        "0x",
    );
    chain.add_log(
        80,
        0,
        FACTORY,
        vec![created.clone(), format!("0x{}", word_address(CHILD_2))],
        "0x",
    );
    // Pre-discovery Ping: ignored even though the address matches later.
    chain.add_log(40, 0, CHILD_1, vec![ping.clone()], "0x");
    chain.add_log(60, 0, CHILD_1, vec![ping.clone()], "0x");
    chain.add_log(90, 0, CHILD_2, vec![ping.clone()], "0x");

    let config = Config::from_json(
        &json!({
            "networks": {
                "testnet": {
                    "chain_id": 1,
                    "transport": {"kind": "http", "url": "http://unused.invalid"},
                    "finality_depth": 5,
                    "polling_interval_ms": 25,
                    "max_block_range": 1000
                }
            },
            "contracts": {
                "Pool": {
                    "network": "testnet",
                    "factory": {"address": FACTORY, "event": "ChildCreated", "parameter": "child"},
                    "start_block": 0,
                    "end_block": 105,
                    "abi": [
                        {"type": "event", "name": "ChildCreated",
                         "inputs": [{"name": "child", "type": "address", "indexed": true}]},
                        {"type": "event", "name": "Ping", "inputs": []}
                    ]
                }
            }
        })
        .to_string(),
    )
    .unwrap();

    let seen: DispatchLog = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    registry.on_event(recorder("Pool", "Ping", None, &seen));

    let cache = Arc::new(SqliteCache::in_memory().await.unwrap());
    let engine = Orchestrator::new(config, registry)
        .with_transport("testnet", chain.clone())
        .with_cache(cache)
        .launch()
        .await
        .unwrap();
    assert_eq!(engine.wait().await, 0);

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            (CHILD_1.to_string(), 60, 0),
            (CHILD_2.to_string(), 90, 0),
        ]
    );
}

// Restarting against a warm cache re-dispatches from disk without a
// single further eth_getLogs.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cache_reuse_skips_refetch() {
    let chain = MockChain::new(110);
    let sel = e_selector();
    chain.add_log(100, 0, TOKEN, vec![sel.clone()], &e_log_data(1, CHILD_1));
    chain.add_log(101, 0, TOKEN, vec![sel.clone()], &e_log_data(2, CHILD_1));

    let contract = json!({
        "network": "testnet",
        "address": TOKEN,
        "start_block": 100,
        "end_block": 102,
        "abi": e_abi_json()
    });

    let db_path = std::env::temp_dir().join(format!("chainfeed-test-{}.db", std::process::id()));
    let _ = std::fs::remove_file(&db_path);
    let db_path = db_path.to_string_lossy().to_string();

    let run = |seen: DispatchLog| {
        let chain = chain.clone();
        let contract = contract.clone();
        let db_path = db_path.clone();
        async move {
            let cache = Arc::new(SqliteCache::open(&db_path).await.unwrap());
            let mut registry = HandlerRegistry::new();
            registry.on_event(recorder("Token", "E", Some("id"), &seen));
            let engine = Orchestrator::new(
                single_network_config(5, 1_000, contract),
                registry,
            )
            .with_transport("testnet", chain)
            .with_cache(cache)
            .launch()
            .await
            .unwrap();
            let store = engine.store().clone();
            assert_eq!(engine.wait().await, 0);
            store
        }
    };

    let seen1: DispatchLog = Arc::new(Mutex::new(Vec::new()));
    let store1 = run(seen1.clone()).await;
    let fetched_after_first = chain.logs_fetched();
    assert!(fetched_after_first > 0);

    let seen2: DispatchLog = Arc::new(Mutex::new(Vec::new()));
    let store2 = run(seen2.clone()).await;

    // Same deliveries, same final store state, zero further log fetches.
    assert_eq!(*seen1.lock().unwrap(), *seen2.lock().unwrap());
    assert_eq!(store1.snapshot("entries"), store2.snapshot("entries"));
    assert_eq!(chain.logs_fetched(), fetched_after_first);

    let _ = std::fs::remove_file(&db_path);
}

// A shallow reorg rolls the store and checkpoint back past the orphaned
// log, then the new branch fills forward.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shallow_reorg_rolls_back() {
    let chain = MockChain::new(101);
    let sel = e_selector();
    chain.add_log(100, 0, TOKEN, vec![sel.clone()], &e_log_data(1, CHILD_1));
    // L exists only on branch 'a' of block 101.
    chain.add_branch_log(101, 0, TOKEN, vec![sel.clone()], &e_log_data(2, CHILD_1), 'a');

    let config = single_network_config(
        5,
        1_000,
        json!({
            "network": "testnet",
            "address": TOKEN,
            "start_block": 90,
            "abi": e_abi_json()
        }),
    );

    let seen: DispatchLog = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    registry.on_event(recorder("Token", "E", Some("id"), &seen));

    let cache = Arc::new(SqliteCache::in_memory().await.unwrap());
    let engine = Orchestrator::new(config, registry)
        .with_transport("testnet", chain.clone())
        .with_cache(cache.clone())
        .launch()
        .await
        .unwrap();

    // Both events arrive through the live path (tip 101, depth 5).
    wait_for(|| seen.lock().unwrap().len() == 2).await;
    let orphaned_hash = {
        let state = chain.state.lock().unwrap();
        hash_of(&state, 101)
    };
    let store = engine.store().clone();
    wait_for(|| store.snapshot("entries").contains_key("2-101-0")).await;

    // Switch blocks 101+ to branch 'b'; L is orphaned.
    chain.set_branch(101, 'b');
    chain.set_branch(102, 'b');
    chain.set_tip(102);

    wait_for(|| {
        futures_block(cache.load_checkpoint(1, "Token"))
            .unwrap()
            .is_some_and(|cp| cp.block_number == 100)
    })
    .await;
    wait_for(|| !store.snapshot("entries").contains_key("2-101-0")).await;

    // The orphaned block is gone from the cache; block 100 survives.
    assert!(!futures_block(cache.has_block(1, &orphaned_hash)).unwrap());
    assert!(store.snapshot("entries").contains_key("1-100-0"));

    assert_eq!(engine.shutdown().await, 0);
}

// Cross-chain interleaving follows (timestamp, chain id) order.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cross_chain_ordering_by_timestamp() {
    let chain_a = MockChain::new(100);
    let chain_b = MockChain::new(100);
    let sel = e_selector();

    chain_a.set_timestamp(10, 1000);
    chain_a.set_timestamp(11, 1002);
    chain_b.set_timestamp(5, 1001);
    chain_a.add_log(10, 0, TOKEN, vec![sel.clone()], &e_log_data(1, CHILD_1));
    chain_a.add_log(11, 0, TOKEN, vec![sel.clone()], &e_log_data(3, CHILD_1));
    chain_b.add_log(5, 0, TOKEN, vec![sel.clone()], &e_log_data(2, CHILD_1));

    let config = Config::from_json(
        &json!({
            "networks": {
                "alpha": {
                    "chain_id": 1,
                    "transport": {"kind": "http", "url": "http://unused.invalid"},
                    "finality_depth": 5, "polling_interval_ms": 25, "max_block_range": 1000
                },
                "beta": {
                    "chain_id": 2,
                    "transport": {"kind": "http", "url": "http://unused.invalid"},
                    "finality_depth": 5, "polling_interval_ms": 25, "max_block_range": 1000
                }
            },
            "contracts": {
                "TokenA": {
                    "network": "alpha", "address": TOKEN,
                    "start_block": 0, "end_block": 50, "abi": e_abi_json()
                },
                "TokenB": {
                    "network": "beta", "address": TOKEN,
                    "start_block": 0, "end_block": 50, "abi": e_abi_json()
                }
            }
        })
        .to_string(),
    )
    .unwrap();

    let seen: DispatchLog = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    registry.on_event(recorder("TokenA", "E", Some("id"), &seen));
    registry.on_event(recorder("TokenB", "E", Some("id"), &seen));

    let cache = Arc::new(SqliteCache::in_memory().await.unwrap());
    let engine = Orchestrator::new(config, registry)
        .with_transport("alpha", chain_a)
        .with_transport("beta", chain_b)
        .with_cache(cache)
        .launch()
        .await
        .unwrap();
    assert_eq!(engine.wait().await, 0);

    let ids: Vec<String> = seen.lock().unwrap().iter().map(|(t, _, _)| t.clone()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
}

/// Await a small future from sync assertion contexts.
fn futures_block<F: std::future::Future>(future: F) -> F::Output {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}
