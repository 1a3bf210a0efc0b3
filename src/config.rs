// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names and default values used
//! throughout the application. Configuration is loaded from the environment
//! at startup; a missing or invalid required value is fatal.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SERVER_PRIVATE_KEY` | Server secp256k1 key (hex, `0x` optional, or SEC1/PKCS#8 PEM) | Required |
//! | `RPC_URL` | JSON-RPC endpoint of the chain | Required |
//! | `CONTRACT_ADDRESS` | Confidential token contract | Required |
//! | `DATA_DIR` | Directory for the embedded database (encrypted volume) | `/data` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `START_BLOCK` | First block to scan when no checkpoint exists | head - 10 000 |
//! | `POLL_INTERVAL_SECS` | Listener poll interval | `5` |
//! | `CONFIRMATION_TIMEOUT_SECS` | Wait for a transaction receipt | `60` |
//! | `RETRY_INTERVAL_SECS` | Retry sweep interval | `30` |
//! | `WORKER_QUEUE_CAPACITY` | Per-identity queue depth | `64` |
//! | `NETWORK_NAME` | Network label used in logs | `ethereum` |
//! | `EXPLORER_URL` | Block explorer base URL for transaction links | Optional |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::Address;
use url::Url;

use crate::blockchain::NetworkConfig;
use crate::identity::ServerIdentity;

pub const SERVER_PRIVATE_KEY_ENV: &str = "SERVER_PRIVATE_KEY";
pub const RPC_URL_ENV: &str = "RPC_URL";
pub const CONTRACT_ADDRESS_ENV: &str = "CONTRACT_ADDRESS";

/// Environment variable name for the data directory path.
///
/// Symmetric balance keys live here in plaintext; mount it on an encrypted volume.
pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const START_BLOCK_ENV: &str = "START_BLOCK";
pub const POLL_INTERVAL_ENV: &str = "POLL_INTERVAL_SECS";
pub const CONFIRMATION_TIMEOUT_ENV: &str = "CONFIRMATION_TIMEOUT_SECS";
pub const RETRY_INTERVAL_ENV: &str = "RETRY_INTERVAL_SECS";
pub const WORKER_QUEUE_CAPACITY_ENV: &str = "WORKER_QUEUE_CAPACITY";
pub const NETWORK_NAME_ENV: &str = "NETWORK_NAME";
pub const EXPLORER_URL_ENV: &str = "EXPLORER_URL";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const DEFAULT_DATA_DIR: &str = "/data";
pub const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug";

/// Name of the redb file inside `DATA_DIR`.
pub const DATABASE_FILE: &str = "confidential-erc20.redb";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(format!("expected json or pretty, got {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub identity: ServerIdentity,
    pub rpc_url: Url,
    pub contract_address: Address,
    pub network: NetworkConfig,
    pub data_dir: PathBuf,
    pub bind_addr: SocketAddr,
    pub start_block: Option<u64>,
    pub poll_interval: Duration,
    pub confirmation_timeout: Duration,
    pub retry_interval: Duration,
    pub worker_queue_capacity: usize,
    pub log_format: LogFormat,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from any name → value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());
        let require = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let identity = ServerIdentity::parse(&require(SERVER_PRIVATE_KEY_ENV)?).map_err(|e| {
            ConfigError::Invalid {
                var: SERVER_PRIVATE_KEY_ENV,
                reason: e.to_string(),
            }
        })?;
        let rpc_url = parse(RPC_URL_ENV, &require(RPC_URL_ENV)?)?;
        let contract_address = parse(CONTRACT_ADDRESS_ENV, &require(CONTRACT_ADDRESS_ENV)?)?;

        let network = NetworkConfig {
            name: get(NETWORK_NAME_ENV).unwrap_or_else(|| "ethereum".to_string()),
            explorer_url: get(EXPLORER_URL_ENV),
        };

        let host = get(HOST_ENV).unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = optional(PORT_ENV, get(PORT_ENV))?.unwrap_or(8080);
        let bind_addr = parse(HOST_ENV, &format!("{host}:{port}"))?;

        Ok(Self {
            identity,
            rpc_url,
            contract_address,
            network,
            data_dir: get(DATA_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            bind_addr,
            start_block: optional(START_BLOCK_ENV, get(START_BLOCK_ENV))?,
            poll_interval: secs(POLL_INTERVAL_ENV, get(POLL_INTERVAL_ENV), 5)?,
            confirmation_timeout: secs(CONFIRMATION_TIMEOUT_ENV, get(CONFIRMATION_TIMEOUT_ENV), 60)?,
            retry_interval: secs(RETRY_INTERVAL_ENV, get(RETRY_INTERVAL_ENV), 30)?,
            worker_queue_capacity: optional(WORKER_QUEUE_CAPACITY_ENV, get(WORKER_QUEUE_CAPACITY_ENV))?
                .unwrap_or(64),
            log_format: optional(LOG_FORMAT_ENV, get(LOG_FORMAT_ENV))?.unwrap_or(LogFormat::Pretty),
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }
}

fn parse<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        reason: e.to_string(),
    })
}

fn optional<T>(var: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|v| parse(var, &v)).transpose()
}

fn secs(var: &'static str, raw: Option<String>, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(optional(var, raw)?.unwrap_or(default)))
}

/// Install the global tracing subscriber.
pub fn init_logging(format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    // Hardhat account #0
    const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            (SERVER_PRIVATE_KEY_ENV, KEY),
            (RPC_URL_ENV, "http://127.0.0.1:8545"),
            (CONTRACT_ADDRESS_ENV, "0x5FbDB2315678afecb367f032d93F642f64180aa3"),
        ]
    }

    #[test]
    fn defaults_apply() {
        let config = ServerConfig::from_lookup(env(&required())).unwrap();
        assert_eq!(
            config.identity.address(),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse::<Address>().unwrap()
        );
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.data_dir, PathBuf::from("/data"));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.confirmation_timeout, Duration::from_secs(60));
        assert_eq!(config.retry_interval, Duration::from_secs(30));
        assert_eq!(config.worker_queue_capacity, 64);
        assert_eq!(config.start_block, None);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(
            config.database_path(),
            PathBuf::from("/data").join(DATABASE_FILE)
        );
    }

    #[test]
    fn each_required_variable_is_fatal() {
        for missing in [SERVER_PRIVATE_KEY_ENV, RPC_URL_ENV, CONTRACT_ADDRESS_ENV] {
            let pairs: Vec<_> = required().into_iter().filter(|(k, _)| *k != missing).collect();
            match ServerConfig::from_lookup(env(&pairs)) {
                Err(ConfigError::Missing(var)) => assert_eq!(var, missing),
                other => panic!("expected Missing({missing}), got {other:?}"),
            }
        }
    }

    #[test]
    fn invalid_values_are_reported() {
        let mut pairs = required();
        pairs.push((PORT_ENV, "eighty"));
        assert!(matches!(
            ServerConfig::from_lookup(env(&pairs)),
            Err(ConfigError::Invalid { var: PORT_ENV, .. })
        ));

        let mut pairs = required();
        pairs[2] = (CONTRACT_ADDRESS_ENV, "0x1234");
        assert!(matches!(
            ServerConfig::from_lookup(env(&pairs)),
            Err(ConfigError::Invalid {
                var: CONTRACT_ADDRESS_ENV,
                ..
            })
        ));

        let mut pairs = required();
        pairs[0] = (SERVER_PRIVATE_KEY_ENV, "not-a-key");
        assert!(matches!(
            ServerConfig::from_lookup(env(&pairs)),
            Err(ConfigError::Invalid {
                var: SERVER_PRIVATE_KEY_ENV,
                ..
            })
        ));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = required();
        pairs.extend([
            (PORT_ENV, "9090"),
            (START_BLOCK_ENV, "1200"),
            (LOG_FORMAT_ENV, "JSON"),
            (EXPLORER_URL_ENV, "https://sepolia.etherscan.io"),
            (WORKER_QUEUE_CAPACITY_ENV, "8"),
        ]);
        let config = ServerConfig::from_lookup(env(&pairs)).unwrap();
        assert_eq!(config.bind_addr.port(), 9090);
        assert_eq!(config.start_block, Some(1200));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.worker_queue_capacity, 8);
        assert_eq!(
            config.network.explorer_url.as_deref(),
            Some("https://sepolia.etherscan.io")
        );
    }
}
