/*
 * Pool state reader: token identities, fee tier and live price snapshots
 */

pub mod contract;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use crate::models::{PoolError, Result, Token};
use crate::price::{decode_price, tick_range};

pub use contract::RpcPoolContract;

/// Fields a pool fixes at deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolImmutables {
    pub token0: Address,
    pub token1: Address,
    pub fee: u32,
    pub tick_spacing: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot0 {
    pub sqrt_price_x96: U256,
    pub tick: i32,
}

#[async_trait]
pub trait PoolContract: Send + Sync {
    async fn immutables(&self, pool: Address) -> Result<PoolImmutables>;
    async fn token_metadata(&self, token: Address) -> Result<Token>;
    async fn slot0(&self, pool: Address) -> Result<Slot0>;
    async fn liquidity(&self, pool: Address) -> Result<u128>;
}

/// Identity of an initialized pool. Resolved once and reused for every snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolState {
    pub address: Address,
    pub token0: Token,
    pub token1: Token,
    /// Fee tier in hundredths of a basis point (3000 = 0.3%).
    pub fee: u32,
    pub tick_spacing: i32,
}

impl PoolState {
    /// The other side of the pair, and whether `token` is token0.
    pub fn counterpart_of(&self, token: Address) -> Result<(&Token, bool)> {
        if token == self.token0.address {
            Ok((&self.token1, true))
        } else if token == self.token1.address {
            Ok((&self.token0, false))
        } else {
            Err(PoolError::TokenNotInPool {
                token,
                pool: self.address,
            })
        }
    }

    #[must_use]
    pub fn token(&self, address: Address) -> Option<&Token> {
        [&self.token0, &self.token1]
            .into_iter()
            .find(|t| t.address == address)
    }

    #[must_use]
    pub fn token_by_symbol(&self, symbol: &str) -> Option<&Token> {
        [&self.token0, &self.token1]
            .into_iter()
            .find(|t| t.symbol.eq_ignore_ascii_case(symbol))
    }
}

/// Point-in-time view of a pool. Every read produces a new one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSnapshot {
    pub state: PoolState,
    pub sqrt_price_x96: U256,
    pub tick: i32,
    pub liquidity: u128,
    pub taken_at: DateTime<Utc>,
}

impl PoolSnapshot {
    /// token1 per token0, or token0 per token1 when `reverse` is set.
    pub fn price(&self, reverse: bool) -> Result<Decimal> {
        decode_price(
            self.sqrt_price_x96,
            self.state.token0.decimals,
            self.state.token1.decimals,
            reverse,
        )
    }

    /// Initialisable tick boundaries around the active tick.
    pub fn active_range(&self) -> Result<(i32, i32)> {
        tick_range(self.tick, self.state.tick_spacing)
    }
}

pub struct PoolStateReader {
    contract: Arc<dyn PoolContract>,
    state: PoolState,
}

impl PoolStateReader {
    /// Resolves token identities and the fee tier of `pool`.
    pub async fn initialize(contract: Arc<dyn PoolContract>, pool: Address) -> Result<Self> {
        let immutables = contract.immutables(pool).await?;

        let (token0, token1) = tokio::try_join!(
            contract.token_metadata(immutables.token0),
            contract.token_metadata(immutables.token1),
        )?;

        let state = PoolState {
            address: pool,
            token0,
            token1,
            fee: immutables.fee,
            tick_spacing: immutables.tick_spacing,
        };

        info!(
            pool = ?pool,
            token0 = %state.token0,
            token1 = %state.token1,
            fee = state.fee,
            tick_spacing = state.tick_spacing,
            "Pool initialized"
        );

        Ok(Self { contract, state })
    }

    #[must_use]
    pub fn state(&self) -> &PoolState {
        &self.state
    }

    /// Reads the live price, tick and liquidity. Does not retry.
    pub async fn snapshot(&self) -> Result<PoolSnapshot> {
        let pool = self.state.address;
        let (slot0, liquidity) = tokio::try_join!(
            self.contract.slot0(pool),
            self.contract.liquidity(pool),
        )?;

        debug!(
            pool = ?pool,
            sqrt_price_x96 = %slot0.sqrt_price_x96,
            tick = slot0.tick,
            liquidity,
            "Snapshot read"
        );

        Ok(PoolSnapshot {
            state: self.state.clone(),
            sqrt_price_x96: slot0.sqrt_price_x96,
            tick: slot0.tick,
            liquidity,
            taken_at: Utc::now(),
        })
    }

    pub async fn get_current_price(&self, reverse: bool) -> Result<Decimal> {
        self.snapshot().await?.price(reverse)
    }
}
