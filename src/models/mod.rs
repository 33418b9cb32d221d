/*
 * Data models and error types shared by the quoting, execution and ingestion paths
 */

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ingest::IngestCheckpoint;

/// An ERC-20 asset as resolved from chain. Resolved once per pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub address: Address,
    pub decimals: u8,
    pub symbol: String,
}

impl Token {
    #[must_use]
    pub fn new(address: Address, decimals: u8, symbol: impl Into<String>) -> Self {
        Self {
            address,
            decimals,
            symbol: symbol.into(),
        }
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?})", self.symbol, self.address)
    }
}

/// Sell = exact input, Buy = exact output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapSide {
    Sell,
    Buy,
}

impl SwapSide {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapSide::Sell => "sell",
            SwapSide::Buy => "buy",
        }
    }
}

/// Result of a simulated trade. A pure value: nothing happens on chain until it is
/// handed to the swap executor.
///
/// Price orientation follows the side of the trade:
/// * `Sell`: `actual_price` and `price_after` are `token_out` per `token_in`.
/// * `Buy`: `actual_price` and `price_after` are `token_in` per `token_out`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub side: SwapSide,
    pub pool: Address,
    pub fee: u32,
    pub token_in: Token,
    pub token_out: Token,
    pub amount_in: Decimal,
    pub amount_out: Decimal,
    pub amount_in_raw: U256,
    pub amount_out_raw: U256,
    pub price_after: Decimal,
    pub actual_price: Decimal,
    pub sqrt_price_x96_after: U256,
    pub tick_after: i32,
    pub ticks_crossed: u32,
    pub gas_units: U256,
    pub gas_price_wei: U256,
    pub gas_cost_native: Decimal,
    pub quoted_at: DateTime<Utc>,
}

/// Receipt state of a submitted transaction as seen by polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Success { block_number: u64, gas_used: U256 },
    Reverted { block_number: u64 },
}

/// A swap that was included and did not revert.
#[derive(Debug, Clone, Serialize)]
pub struct SwapReceipt {
    pub tx_hash: H256,
    pub side: SwapSide,
    pub block_number: u64,
    pub gas_used: U256,
    pub quote: Quote,
    /// Minimum output for a sell, maximum input for a buy.
    pub limit: Decimal,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Malformed price: {0}")]
    MalformedPrice(String),

    #[error("Pool not found at {pool:?}: {reason}")]
    PoolNotFound { pool: Address, reason: String },

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient liquidity: {0}")]
    InsufficientLiquidity(String),

    #[error("Unknown token {0}")]
    UnknownToken(String),

    #[error("Token {token:?} is not part of pool {pool:?}")]
    TokenNotInPool { token: Address, pool: Address },

    #[error("Insufficient balance of {symbol}: have {available}, need {required}")]
    InsufficientBalance {
        symbol: String,
        available: U256,
        required: U256,
    },

    #[error("Invalid slippage tolerance {0}: must be within [0, 1)")]
    InvalidSlippage(Decimal),

    #[error("Slippage exceeded: {0}")]
    SlippageExceeded(String),

    #[error("Deadline {0} has already passed")]
    DeadlineExpired(DateTime<Utc>),

    #[error("Transaction {tx_hash:?} reverted: {}", reason.as_deref().unwrap_or("no reason given"))]
    Reverted {
        tx_hash: H256,
        reason: Option<String>,
    },

    #[error("Transaction {tx_hash:?} not confirmed within {waited_secs}s; it may still be mined")]
    TimedOut { tx_hash: H256, waited_secs: u64 },

    #[error(
        "Ingestion of pool {} interrupted at offset {}: {source}",
        .checkpoint.pool_id,
        .checkpoint.offset
    )]
    IngestInterrupted {
        checkpoint: Box<IngestCheckpoint>,
        source: Box<PoolError>,
    },

    #[error("Query service error: {0}")]
    QueryService(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Contract interaction error: {0}")]
    ContractError(String),

    #[error("Calculation error: {0}")]
    CalculationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl PoolError {
    /// Errors that never reached the counterparty and may be repeated safely.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, PoolError::NetworkUnavailable(_))
    }
}

impl From<reqwest::Error> for PoolError {
    fn from(e: reqwest::Error) -> Self {
        PoolError::NetworkUnavailable(format!("HTTP request failed: {e}"))
    }
}

impl From<config::ConfigError> for PoolError {
    fn from(e: config::ConfigError) -> Self {
        PoolError::ConfigError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
