//! The per-network RPC gateway.
//!
//! One gateway per network wraps a transport (http, ws, or fallback chain)
//! behind a bounded concurrency cap, applies the retry policy to transport
//! failures, and exposes typed `eth_*` helpers that parse wire responses
//! into the cached record types.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};

use chainfeed_core::types::{
    normalize_hex, parse_hex_u64, to_hex, CachedBlock, CachedLog, CachedTransaction,
};
use chainfeed_core::EngineError;

use crate::error::TransportError;
use crate::request::JsonRpcRequest;
use crate::retry::RetryPolicy;
use crate::transport::RpcTransport;

// ─── Wire types ──────────────────────────────────────────────────────────────

/// A raw log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: String,
    pub block_hash: String,
    pub transaction_hash: String,
    pub transaction_index: String,
    pub log_index: String,
    #[serde(default)]
    pub removed: bool,
}

impl RawLog {
    pub fn into_cached(self, chain_id: u64) -> CachedLog {
        CachedLog {
            chain_id,
            block_hash: normalize_hex(&self.block_hash),
            block_number: parse_hex_u64(&self.block_number),
            log_index: parse_hex_u64(&self.log_index) as u32,
            address: normalize_hex(&self.address),
            topics: self.topics.iter().map(|t| normalize_hex(t)).collect(),
            data: self.data,
            tx_hash: normalize_hex(&self.transaction_hash),
            tx_index: parse_hex_u64(&self.transaction_index) as u32,
        }
    }
}

/// A raw block header; `transactions` holds hashes or full objects
/// depending on the hydrate flag of the request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlock {
    pub hash: String,
    pub parent_hash: String,
    pub number: String,
    pub timestamp: String,
    #[serde(default)]
    pub gas_used: Option<String>,
    #[serde(default)]
    pub miner: Option<String>,
    #[serde(default)]
    pub transactions: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    hash: String,
    transaction_index: String,
    from: String,
    #[serde(default)]
    to: Option<String>,
    value: String,
    input: String,
    nonce: String,
}

impl RawBlock {
    pub fn into_cached(self, chain_id: u64) -> (CachedBlock, Vec<CachedTransaction>) {
        let block = CachedBlock {
            chain_id,
            hash: normalize_hex(&self.hash),
            parent_hash: normalize_hex(&self.parent_hash),
            number: parse_hex_u64(&self.number),
            timestamp: parse_hex_u64(&self.timestamp) as i64,
            gas_used: self.gas_used.clone(),
            miner: self.miner.as_deref().map(normalize_hex),
        };
        let txs = self
            .transactions
            .iter()
            .filter(|v| v.is_object())
            .filter_map(|v| serde_json::from_value::<RawTransaction>(v.clone()).ok())
            .map(|raw| CachedTransaction {
                chain_id,
                hash: normalize_hex(&raw.hash),
                block_hash: block.hash.clone(),
                tx_index: parse_hex_u64(&raw.transaction_index) as u32,
                from: normalize_hex(&raw.from),
                to: raw.to.as_deref().map(normalize_hex),
                value: parse_hex_u64(&raw.value).to_string(),
                input: raw.input,
                nonce: parse_hex_u64(&raw.nonce),
            })
            .collect();
        (block, txs)
    }
}

// ─── Log filter ──────────────────────────────────────────────────────────────

/// Parameters for an `eth_getLogs` request.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    /// Emitting addresses; empty matches every address.
    pub addresses: Vec<String>,
    /// Topic slots 0..=3; `None` matches anything in that slot.
    pub topics: Vec<Option<Vec<String>>>,
}

impl LogFilter {
    fn to_params(&self) -> Value {
        let mut filter = json!({
            "fromBlock": to_hex(self.from_block),
            "toBlock": to_hex(self.to_block),
        });
        if !self.addresses.is_empty() {
            filter["address"] = json!(self.addresses);
        }
        // Trailing `null` topic slots are dropped; nodes treat a shorter
        // topics array the same way.
        let last_used = self.topics.iter().rposition(Option::is_some);
        if let Some(last) = last_used {
            let topics: Vec<Value> = self.topics[..=last]
                .iter()
                .map(|slot| match slot {
                    None => Value::Null,
                    Some(values) if values.len() == 1 => json!(values[0]),
                    Some(values) => json!(values),
                })
                .collect();
            filter["topics"] = Value::Array(topics);
        }
        json!([filter])
    }
}

// ─── Gateway ─────────────────────────────────────────────────────────────────

/// Configuration for a network's gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub retry: crate::retry::RetryConfig,
    /// Per-call timeout; exceeding it counts as a transport failure.
    pub request_timeout: Duration,
    /// Bounded concurrency shared by every caller on this network.
    pub max_concurrency: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry: crate::retry::RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
            max_concurrency: 10,
        }
    }
}

/// Per-network request channel: every RPC the engine makes goes through
/// `request`, which serializes access through the semaphore and applies
/// the retry policy.
pub struct RpcGateway {
    network: String,
    chain_id: u64,
    transport: Arc<dyn RpcTransport>,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    request_timeout: Duration,
    next_id: AtomicU64,
}

impl RpcGateway {
    pub fn new(
        network: impl Into<String>,
        chain_id: u64,
        transport: Arc<dyn RpcTransport>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            network: network.into(),
            chain_id,
            transport,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            retry: RetryPolicy::new(config.retry),
            request_timeout: config.request_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn supports_subscriptions(&self) -> bool {
        self.transport.supports_subscriptions()
    }

    pub async fn subscribe_new_heads(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<Value>, TransportError> {
        self.transport.subscribe_new_heads().await
    }

    /// Send one JSON-RPC request. Transport failures are retried with
    /// backoff up to the attempt budget, then surface as `RpcUnavailable`.
    /// Errors the node returned surface as `RpcApplication`, unretried.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| EngineError::Aborted("gateway closed".into()))?;

        let mut failures = 0u32;
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let req = JsonRpcRequest::new(id, method, params.clone());

            let outcome = tokio::time::timeout(self.request_timeout, self.transport.send(req))
                .await
                .unwrap_or(Err(TransportError::Timeout {
                    ms: self.request_timeout.as_millis() as u64,
                }));

            match outcome {
                Ok(resp) => {
                    return resp.into_result().map_err(|e| EngineError::RpcApplication {
                        code: e.code,
                        message: e.message,
                    });
                }
                Err(TransportError::Rpc(e)) => {
                    return Err(EngineError::RpcApplication {
                        code: e.code,
                        message: e.message,
                    });
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    match self.retry.next_delay(failures) {
                        Some(delay) => {
                            tracing::warn!(
                                network = %self.network,
                                method,
                                failures,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "retrying request"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            tracing::error!(
                                network = %self.network,
                                method,
                                failures,
                                error = %e,
                                "retries exhausted"
                            );
                            return Err(EngineError::RpcUnavailable(format!(
                                "{method} on {}: {e}",
                                self.network
                            )));
                        }
                    }
                }
                Err(e) => {
                    return Err(EngineError::RpcUnavailable(format!(
                        "{method} on {}: {e}",
                        self.network
                    )));
                }
            }
        }
    }

    // ─── Typed helpers ───────────────────────────────────────────────────────

    /// Current chain tip via `eth_blockNumber`.
    pub async fn block_number(&self) -> Result<u64, EngineError> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        Ok(result.as_str().map(parse_hex_u64).unwrap_or(0))
    }

    /// Matching logs via `eth_getLogs`.
    pub async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<CachedLog>, EngineError> {
        let result = self.request("eth_getLogs", filter.to_params()).await?;
        let raw: Vec<RawLog> = serde_json::from_value(result)
            .map_err(|e| EngineError::Decode(format!("eth_getLogs response: {e}")))?;
        Ok(raw
            .into_iter()
            .filter(|l| !l.removed)
            .map(|l| l.into_cached(self.chain_id))
            .collect())
    }

    /// Block by number; `hydrate` includes full transaction objects.
    pub async fn get_block_by_number(
        &self,
        number: u64,
        hydrate: bool,
    ) -> Result<Option<(CachedBlock, Vec<CachedTransaction>)>, EngineError> {
        let result = self
            .request("eth_getBlockByNumber", json!([to_hex(number), hydrate]))
            .await?;
        parse_block(result, self.chain_id)
    }

    /// Block by hash; `hydrate` includes full transaction objects.
    pub async fn get_block_by_hash(
        &self,
        hash: &str,
        hydrate: bool,
    ) -> Result<Option<(CachedBlock, Vec<CachedTransaction>)>, EngineError> {
        let result = self
            .request("eth_getBlockByHash", json!([hash, hydrate]))
            .await?;
        parse_block(result, self.chain_id)
    }

    /// Read-only contract call via `eth_call` at a block number (or the
    /// latest state when `block` is `None`).
    pub async fn call(
        &self,
        to: &str,
        data: &str,
        block: Option<u64>,
    ) -> Result<String, EngineError> {
        let tag = block.map(to_hex).unwrap_or_else(|| "latest".into());
        let result = self
            .request("eth_call", json!([{"to": to, "data": data}, tag]))
            .await?;
        Ok(result.as_str().unwrap_or_default().to_string())
    }
}

fn parse_block(
    result: Value,
    chain_id: u64,
) -> Result<Option<(CachedBlock, Vec<CachedTransaction>)>, EngineError> {
    if result.is_null() {
        return Ok(None);
    }
    let raw: RawBlock = serde_json::from_value(result)
        .map_err(|e| EngineError::Decode(format!("block response: {e}")))?;
    Ok(Some(raw.into_cached(chain_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{JsonRpcError, JsonRpcResponse};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// Scripted transport: pops the next outcome per call.
    struct ScriptedTransport {
        outcomes: Mutex<Vec<Result<Value, TransportError>>>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<Result<Value, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RpcTransport for ScriptedTransport {
        async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                return Err(TransportError::Http("script exhausted".into()));
            }
            outcomes.remove(0).map(|v| JsonRpcResponse::ok(req.id, v))
        }
        fn url(&self) -> &str {
            "scripted"
        }
    }

    fn gateway(transport: Arc<dyn RpcTransport>) -> RpcGateway {
        let config = GatewayConfig {
            retry: crate::retry::RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                multiplier: 1.0,
                jitter_fraction: 0.0,
            },
            request_timeout: Duration::from_secs(5),
            max_concurrency: 2,
        };
        RpcGateway::new("testnet", 1, transport, config)
    }

    #[tokio::test]
    async fn retries_transport_failures_then_succeeds() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Http("refused".into())),
            Err(TransportError::Timeout { ms: 10 }),
            Ok(json!("0x10")),
        ]);
        let gw = gateway(transport.clone());
        assert_eq!(gw.block_number().await.unwrap(), 16);
        assert_eq!(transport.calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn exhaustion_maps_to_unavailable() {
        let transport = ScriptedTransport::new(vec![]);
        let gw = gateway(transport);
        let err = gw.block_number().await.unwrap_err();
        assert!(matches!(err, EngineError::RpcUnavailable(_)));
    }

    #[tokio::test]
    async fn application_errors_are_not_retried() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Rpc(JsonRpcError {
            code: -32005,
            message: "query returned more than 10000 results".into(),
            data: None,
        }))]);
        let gw = gateway(transport.clone());
        let err = gw.block_number().await.unwrap_err();
        assert!(err.is_range_too_large());
        assert_eq!(transport.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn log_filter_params_shape() {
        let filter = LogFilter {
            from_block: 0,
            to_block: 255,
            addresses: vec!["0xabc".into()],
            topics: vec![Some(vec!["0xsel".into()]), None],
        };
        let params = filter.to_params();
        assert_eq!(params[0]["fromBlock"], "0x0");
        assert_eq!(params[0]["toBlock"], "0xff");
        assert_eq!(params[0]["address"][0], "0xabc");
        // trailing None dropped, single value unwrapped
        assert_eq!(params[0]["topics"], json!(["0xsel"]));
    }

    #[test]
    fn raw_log_conversion() {
        let raw = RawLog {
            address: "0xAbC0000000000000000000000000000000000001".into(),
            topics: vec!["0xT0".into()],
            data: "0x".into(),
            block_number: "0x64".into(),
            block_hash: "0xB1".into(),
            transaction_hash: "0xTx".into(),
            transaction_index: "0x2".into(),
            log_index: "0x5".into(),
            removed: false,
        };
        let log = raw.into_cached(1);
        assert_eq!(log.block_number, 100);
        assert_eq!(log.log_index, 5);
        assert_eq!(log.tx_index, 2);
        assert_eq!(log.address, "0xabc0000000000000000000000000000000000001");
    }
}
