/*
 * Layered configuration: built-in defaults, optional TOML file, POOLHELPER_ environment
 */

use chrono::Duration as ChronoDuration;
use config::{Environment, File};
use ethers::types::{Address, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use crate::execution::{validate_slippage, ExecutionSettings, RetryPolicy};
use crate::models::{PoolError, Result};

const DEFAULT_FILE: &str = "poolhelper.toml";
const ENV_PREFIX: &str = "POOLHELPER";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub chain: ChainConfig,
    pub gas: GasConfig,
    pub trading: TradingConfig,
    pub subgraph: SubgraphConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub pool_address: Address,
    /// QuoterV2
    pub quoter_address: Address,
    /// SwapRouter02
    pub router_address: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GasSource {
    Rpc,
    Fixed,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GasConfig {
    pub source: GasSource,
    pub fixed_gwei: u64,
    pub swap_gas_limit: u64,
    pub approve_gas_limit: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TradingConfig {
    pub default_slippage: Decimal,
    pub deadline_secs: u64,
    pub confirmation_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub submit_retries: u32,
    pub submit_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SubgraphConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub page_size: usize,
    pub request_delay_ms: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Falls back to `chain.pool_address` when unset.
    pub pool_id: Option<String>,
    pub timestamp_gte: Option<u64>,
    pub timestamp_lte: Option<u64>,
    pub output: PathBuf,
    pub resume: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://ethereum-rpc.publicnode.com".to_string(),
            chain_id: 1,
            pool_address: Address::zero(),
            quoter_address: known_address("0x61fFE014bA17989E743c5F6cB21bF9697530B21e"),
            router_address: known_address("0x68b3465833fb72A70ecDF485E0e4C7bD8665Fc45"),
        }
    }
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            source: GasSource::Rpc,
            fixed_gwei: 30,
            swap_gas_limit: 300_000,
            approve_gas_limit: 100_000,
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            default_slippage: Decimal::new(5, 3),
            deadline_secs: 300,
            confirmation_timeout_secs: 180,
            poll_interval_ms: 2_000,
            submit_retries: 3,
            submit_backoff_ms: 500,
        }
    }
}

impl Default for SubgraphConfig {
    fn default() -> Self {
        Self {
            url: "https://gateway.thegraph.com/api/subgraphs/id/5zvR82QoaXYFyDEKLZ9t6v9adgnptxYpKpSbxtgVENFV"
                .to_string(),
            api_key: None,
            page_size: 1_000,
            request_delay_ms: 250,
            timeout_secs: 30,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            pool_id: None,
            timestamp_gte: None,
            timestamp_lte: None,
            output: PathBuf::from("swaps.csv"),
            resume: false,
        }
    }
}

/// Parses a compile-time constant address.
fn known_address(hex: &str) -> Address {
    Address::from_str(hex).unwrap_or_default()
}

impl Config {
    /// Defaults, then `path` (or `poolhelper.toml` when present), then
    /// `POOLHELPER_SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_FILE).required(false),
        };

        let config: Config = config::Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_slippage(self.trading.default_slippage)
            .map_err(|e| PoolError::ConfigError(format!("trading.default_slippage: {e}")))?;

        if self.subgraph.page_size == 0 || self.subgraph.page_size > 1_000 {
            return Err(PoolError::ConfigError(format!(
                "subgraph.page_size must be within 1..=1000, got {}",
                self.subgraph.page_size
            )));
        }

        let non_zero = [
            ("trading.deadline_secs", self.trading.deadline_secs),
            ("trading.confirmation_timeout_secs", self.trading.confirmation_timeout_secs),
            ("trading.poll_interval_ms", self.trading.poll_interval_ms),
            ("subgraph.timeout_secs", self.subgraph.timeout_secs),
            ("gas.swap_gas_limit", self.gas.swap_gas_limit),
            ("gas.approve_gas_limit", self.gas.approve_gas_limit),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(PoolError::ConfigError(format!("{name} must be greater than zero")));
        }

        if self.gas.source == GasSource::Fixed && self.gas.fixed_gwei == 0 {
            return Err(PoolError::ConfigError(
                "gas.fixed_gwei must be set when gas.source = \"fixed\"".to_string(),
            ));
        }

        if let (Some(gte), Some(lte)) = (self.ingest.timestamp_gte, self.ingest.timestamp_lte) {
            if gte > lte {
                return Err(PoolError::ConfigError(format!(
                    "ingest.timestamp_gte ({gte}) is after ingest.timestamp_lte ({lte})"
                )));
            }
        }

        if self.chain.rpc_url.is_empty() {
            return Err(PoolError::ConfigError("chain.rpc_url is not set".to_string()));
        }
        Ok(())
    }

    /// The configured pool, rejecting the unset zero address.
    pub fn pool_address(&self) -> Result<Address> {
        if self.chain.pool_address.is_zero() {
            return Err(PoolError::ConfigError(
                "chain.pool_address is not set (POOLHELPER_CHAIN__POOL_ADDRESS)".to_string(),
            ));
        }
        Ok(self.chain.pool_address)
    }

    /// Subgraph pool id for ingestion: `ingest.pool_id`, else the configured pool.
    pub fn ingest_pool_id(&self) -> Result<String> {
        match &self.ingest.pool_id {
            Some(id) if !id.is_empty() => Ok(id.to_lowercase()),
            _ => Ok(format!("{:?}", self.pool_address()?)),
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.trading.submit_retries,
            initial_delay: Duration::from_millis(self.trading.submit_backoff_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn execution_settings(&self) -> Result<ExecutionSettings> {
        let deadline_secs = i64::try_from(self.trading.deadline_secs).map_err(|_| {
            PoolError::ConfigError(format!(
                "trading.deadline_secs {} is out of range",
                self.trading.deadline_secs
            ))
        })?;

        Ok(ExecutionSettings {
            router: self.chain.router_address,
            swap_gas_limit: U256::from(self.gas.swap_gas_limit),
            approve_gas_limit: U256::from(self.gas.approve_gas_limit),
            deadline: ChronoDuration::seconds(deadline_secs),
            confirmation_timeout: Duration::from_secs(self.trading.confirmation_timeout_secs),
            poll_interval: Duration::from_millis(self.trading.poll_interval_ms),
            retry: self.retry_policy(),
        })
    }
}
