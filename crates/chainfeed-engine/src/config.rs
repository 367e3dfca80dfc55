//! The configuration surface: networks, contracts, database, options.
//!
//! Deserialized from JSON; environment variables fill the conventional
//! gaps (`CHAINFEED_RPC_URL_<chainId>` for a network's transport,
//! `DATABASE_URL` to select Postgres when no database block is given).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use chainfeed_core::{
    network::{default_block_range, default_finality_depth},
    EngineError, EventAbi, EventSource, FactorySpec, Network, SourceKind, TopicFilter,
};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
    #[serde(default)]
    pub contracts: BTreeMap<String, ContractConfig>,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub options: OptionsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    /// Transport; when absent, `CHAINFEED_RPC_URL_<chainId>` supplies an
    /// HTTP endpoint.
    #[serde(default)]
    pub transport: Option<TransportConfig>,
    #[serde(default)]
    pub polling_interval_ms: Option<u64>,
    #[serde(default)]
    pub max_block_range: Option<u64>,
    #[serde(default)]
    pub max_task_concurrency: Option<usize>,
    #[serde(default)]
    pub finality_depth: Option<u64>,
}

/// How to reach a network. A fallback chain tries each entry in order on
/// transport-level failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Http { url: String },
    Ws { url: String },
    Fallback { transports: Vec<TransportConfig> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    /// Standard JSON ABI (the event entries are what matters here).
    pub abi: Value,
    pub network: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub factory: Option<FactoryConfig>,
    #[serde(default)]
    pub filter: Option<TopicFilter>,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default)]
    pub end_block: Option<u64>,
    #[serde(default)]
    pub max_block_range: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FactoryConfig {
    pub address: String,
    /// Creation-event name on the ABI.
    pub event: String,
    /// Parameter holding the child address.
    pub parameter: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite {
        #[serde(default = "default_sqlite_filename")]
        filename: String,
    },
    Postgres {
        connection_string: String,
    },
}

fn default_sqlite_filename() -> String {
    ".chainfeed/cache.db".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptionsConfig {
    /// A network is healthy while `tip - last_dispatched` stays at or
    /// under this many blocks.
    #[serde(default = "default_healthcheck_lag")]
    pub max_healthcheck_lag: u64,
}

fn default_healthcheck_lag() -> u64 {
    50
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            max_healthcheck_lag: default_healthcheck_lag(),
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::Config(format!("config parse: {e}")))
    }

    /// Build the immutable `Network` set.
    pub fn networks(&self) -> Vec<Network> {
        self.networks
            .iter()
            .map(|(name, nc)| Network {
                name: name.clone(),
                chain_id: nc.chain_id,
                polling_interval_ms: nc.polling_interval_ms.unwrap_or(1_000),
                max_block_range: nc
                    .max_block_range
                    .unwrap_or_else(|| default_block_range(nc.chain_id)),
                max_task_concurrency: nc.max_task_concurrency.unwrap_or(10),
                finality_depth: nc
                    .finality_depth
                    .unwrap_or_else(|| default_finality_depth(nc.chain_id)),
            })
            .collect()
    }

    /// Build and validate the source set.
    pub fn sources(&self) -> Result<Vec<EventSource>, EngineError> {
        let mut sources = Vec::new();
        for (name, cc) in &self.contracts {
            if !self.networks.contains_key(&cc.network) {
                return Err(EngineError::Config(format!(
                    "contract `{name}` references unknown network `{}`",
                    cc.network
                )));
            }
            let abi = EventAbi::from_json(&cc.abi)?;
            let kind = match (&cc.factory, &cc.address, &cc.addresses[..]) {
                (Some(factory), None, []) => SourceKind::Factory(FactorySpec {
                    address: factory.address.to_ascii_lowercase(),
                    event: factory.event.clone(),
                    parameter: factory.parameter.clone(),
                }),
                (None, Some(addr), []) => SourceKind::Static {
                    addresses: vec![addr.to_ascii_lowercase()],
                },
                (None, None, addrs) if !addrs.is_empty() => SourceKind::Static {
                    addresses: addrs.iter().map(|a| a.to_ascii_lowercase()).collect(),
                },
                _ => {
                    return Err(EngineError::Config(format!(
                        "contract `{name}` needs exactly one of `address`, `addresses`, `factory`"
                    )))
                }
            };
            let source = EventSource {
                name: name.clone(),
                network: cc.network.clone(),
                kind,
                abi,
                topics: cc.filter.clone(),
                start_block: cc.start_block,
                end_block: cc.end_block,
            };
            source.validate()?;
            sources.push(source);
        }
        Ok(sources)
    }

    /// The transport for a network, falling back to the conventional
    /// `CHAINFEED_RPC_URL_<chainId>` environment variable.
    pub fn transport_for(&self, network: &str) -> Result<TransportConfig, EngineError> {
        let nc = self
            .networks
            .get(network)
            .ok_or_else(|| EngineError::Config(format!("unknown network `{network}`")))?;
        if let Some(transport) = &nc.transport {
            return Ok(transport.clone());
        }
        let var = format!("CHAINFEED_RPC_URL_{}", nc.chain_id);
        match std::env::var(&var) {
            Ok(url) if url.starts_with("ws") => Ok(TransportConfig::Ws { url }),
            Ok(url) => Ok(TransportConfig::Http { url }),
            Err(_) => Err(EngineError::Config(format!(
                "network `{network}` has no transport and {var} is unset"
            ))),
        }
    }

    /// The database to open: the configured one, else Postgres via
    /// `DATABASE_URL`, else embedded SQLite.
    pub fn database(&self) -> DatabaseConfig {
        if let Some(db) = &self.database {
            return db.clone();
        }
        match std::env::var("DATABASE_URL") {
            Ok(connection_string) => DatabaseConfig::Postgres { connection_string },
            Err(_) => DatabaseConfig::Sqlite {
                filename: default_sqlite_filename(),
            },
        }
    }

    /// Per-source `eth_getLogs` span: the contract override, else the
    /// network default.
    pub fn block_range_for(&self, source: &EventSource, network: &Network) -> u64 {
        self.contracts
            .get(&source.name)
            .and_then(|c| c.max_block_range)
            .unwrap_or(network.max_block_range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_config() -> Config {
        Config::from_json(
            &json!({
                "networks": {
                    "mainnet": {
                        "chain_id": 1,
                        "transport": {"kind": "http", "url": "https://rpc.example"},
                        "finality_depth": 6
                    }
                },
                "contracts": {
                    "Token": {
                        "network": "mainnet",
                        "address": "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
                        "start_block": 100,
                        "abi": [{
                            "type": "event",
                            "name": "Transfer",
                            "inputs": [
                                {"name": "from", "type": "address", "indexed": true},
                                {"name": "to", "type": "address", "indexed": true},
                                {"name": "value", "type": "uint256"}
                            ]
                        }]
                    }
                }
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn networks_and_sources_resolve() {
        let config = minimal_config();
        let networks = config.networks();
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].chain_id, 1);
        assert_eq!(networks[0].finality_depth, 6);

        let sources = config.sources().unwrap();
        assert_eq!(sources.len(), 1);
        // address was lowercased before validation
        match &sources[0].kind {
            SourceKind::Static { addresses } => {
                assert_eq!(addresses[0], "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
            }
            _ => panic!("expected static source"),
        }
    }

    #[test]
    fn unknown_network_rejected() {
        let config = Config::from_json(
            &json!({
                "contracts": {
                    "Token": {"network": "nope", "address": "0x00", "abi": []}
                }
            })
            .to_string(),
        )
        .unwrap();
        assert!(matches!(config.sources(), Err(EngineError::Config(_))));
    }

    #[test]
    fn address_and_factory_are_mutually_exclusive() {
        let config = Config::from_json(
            &json!({
                "networks": {"mainnet": {"chain_id": 1}},
                "contracts": {
                    "Pool": {
                        "network": "mainnet",
                        "address": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                        "factory": {"address": "0xf", "event": "E", "parameter": "p"},
                        "abi": []
                    }
                }
            })
            .to_string(),
        )
        .unwrap();
        assert!(config.sources().is_err());
    }

    #[test]
    fn database_defaults_to_sqlite() {
        let config = minimal_config();
        assert!(matches!(config.database(), DatabaseConfig::Sqlite { .. }));
    }
}
