//! The context handed to user handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chainfeed_core::{EngineError, EventAbi};
use chainfeed_rpc::RpcGateway;

use crate::store::StoreTxn;

/// The network a handler's event came from.
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub name: String,
    pub chain_id: u64,
}

/// Static info about a configured contract, exposed to handlers.
#[derive(Debug, Clone)]
pub struct ContractInfo {
    pub abi: EventAbi,
    pub address: Option<String>,
    pub start_block: u64,
    pub end_block: Option<u64>,
}

/// Read-only chain access with memoization: a call pinned to a finalized
/// block can never change, so its result is cached by
/// `(address, calldata, block)`.
pub struct ContractReader {
    gateway: Arc<RpcGateway>,
    cache: Mutex<HashMap<(String, String, u64), String>>,
    finalized: AtomicU64,
}

impl ContractReader {
    pub fn new(gateway: Arc<RpcGateway>) -> Self {
        Self {
            gateway,
            cache: Mutex::new(HashMap::new()),
            finalized: AtomicU64::new(0),
        }
    }

    /// Keep the memoization boundary at the chain's finality boundary.
    pub fn set_finalized(&self, block: u64) {
        self.finalized.fetch_max(block, Ordering::Relaxed);
    }

    /// `eth_call` against `address` with raw calldata, optionally pinned
    /// to a block number. Pinned finalized calls are served from memory
    /// after the first hit.
    pub async fn read_contract(
        &self,
        address: &str,
        calldata: &str,
        block: Option<u64>,
    ) -> Result<String, EngineError> {
        let cacheable = block.is_some_and(|b| b <= self.finalized.load(Ordering::Relaxed));
        let key = (address.to_string(), calldata.to_string(), block.unwrap_or(0));
        if cacheable {
            if let Some(result) = self.cache.lock().unwrap().get(&key) {
                return Ok(result.clone());
            }
        }
        let result = self.gateway.call(address, calldata, block).await?;
        if cacheable {
            self.cache.lock().unwrap().insert(key, result.clone());
        }
        Ok(result)
    }
}

/// Everything a handler gets besides the event itself: the transactional
/// store handle, read-only chain access, and its network/contract info.
pub struct HandlerContext<'a, 'b> {
    pub db: &'a mut StoreTxn<'b>,
    pub client: &'a ContractReader,
    pub network: NetworkInfo,
    pub contracts: &'a HashMap<String, ContractInfo>,
}

impl HandlerContext<'_, '_> {
    pub fn contract(&self, name: &str) -> Option<&ContractInfo> {
        self.contracts.get(name)
    }
}
