/*
 * Quote engine: exact-input and exact-output quotes against a simulation oracle
 */

pub mod quoter;

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, U256};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use crate::metrics::Metrics;
use crate::models::{PoolError, Quote, Result, SwapSide, Token};
use crate::pool::PoolSnapshot;
use crate::price::{decode_price, tick_at_sqrt_ratio};
use crate::utils::{
    from_base_units, pow10, ratio_to_decimal, round_to_token, to_base_units, u256_to_biguint, wei_to_native,
};

pub use quoter::QuoterV2;

/// One simulated single-pool trade. `amount` is the input for a sell and the
/// desired output for a buy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleRequest {
    pub token_in: Address,
    pub token_out: Address,
    pub fee: u32,
    pub amount: U256,
    pub side: SwapSide,
}

/// Simulation outcome. `amount` is the counter-amount: output for a sell,
/// required input for a buy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleQuote {
    pub amount: U256,
    pub sqrt_price_x96_after: U256,
    pub ticks_crossed: u32,
    pub gas_units: U256,
}

#[async_trait]
pub trait QuotingOracle: Send + Sync {
    async fn simulate(&self, request: &OracleRequest) -> Result<OracleQuote>;
}

#[async_trait]
pub trait GasPriceSource: Send + Sync {
    /// Wei per gas unit.
    async fn gas_price(&self) -> Result<U256>;
}

/// A configured constant gas price.
pub struct FixedGasPrice(pub U256);

impl FixedGasPrice {
    #[must_use]
    pub fn from_gwei(gwei: u64) -> Self {
        Self(U256::from(gwei) * U256::exp10(9))
    }
}

#[async_trait]
impl GasPriceSource for FixedGasPrice {
    async fn gas_price(&self) -> Result<U256> {
        Ok(self.0)
    }
}

pub struct QuoteEngine {
    oracle: Arc<dyn QuotingOracle>,
    gas: Arc<dyn GasPriceSource>,
    metrics: Option<Arc<Metrics>>,
}

impl QuoteEngine {
    #[must_use]
    pub fn new(oracle: Arc<dyn QuotingOracle>, gas: Arc<dyn GasPriceSource>) -> Self {
        Self {
            oracle,
            gas,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// How much of the counterpart token `amount_in` of `token_in` buys.
    pub async fn quote_sell(
        &self,
        token_in: Address,
        amount_in: Decimal,
        snapshot: &PoolSnapshot,
    ) -> Result<Quote> {
        let result = self.sell(token_in, amount_in, snapshot).await;
        self.record(SwapSide::Sell, &result);
        result
    }

    /// How much of the counterpart token it takes to receive `amount_out` of `token_out`.
    pub async fn quote_buy(
        &self,
        token_out: Address,
        amount_out: Decimal,
        snapshot: &PoolSnapshot,
    ) -> Result<Quote> {
        let result = self.buy(token_out, amount_out, snapshot).await;
        self.record(SwapSide::Buy, &result);
        result
    }

    async fn sell(&self, token_in: Address, amount_in: Decimal, snapshot: &PoolSnapshot) -> Result<Quote> {
        let state = &snapshot.state;
        let (token_out, in_is_token0) = state.counterpart_of(token_in)?;
        let token_in = if in_is_token0 { &state.token0 } else { &state.token1 };

        let amount_in_raw = positive_base_units(amount_in, token_in)?;
        let request = OracleRequest {
            token_in: token_in.address,
            token_out: token_out.address,
            fee: state.fee,
            amount: amount_in_raw,
            side: SwapSide::Sell,
        };
        let simulated = self.oracle.simulate(&request).await?;

        if simulated.amount.is_zero() {
            return Err(PoolError::InsufficientLiquidity(format!(
                "Selling {amount_in} {} in pool {:?} returns nothing",
                token_in.symbol, state.address
            )));
        }

        self.build_quote(
            SwapSide::Sell,
            snapshot,
            token_in,
            token_out,
            amount_in_raw,
            simulated.amount,
            &simulated,
            !in_is_token0,
        )
        .await
    }

    async fn buy(&self, token_out: Address, amount_out: Decimal, snapshot: &PoolSnapshot) -> Result<Quote> {
        let state = &snapshot.state;
        let (token_in, out_is_token0) = state.counterpart_of(token_out)?;
        let token_out = if out_is_token0 { &state.token0 } else { &state.token1 };

        let amount_out_raw = positive_base_units(amount_out, token_out)?;
        let request = OracleRequest {
            token_in: token_in.address,
            token_out: token_out.address,
            fee: state.fee,
            amount: amount_out_raw,
            side: SwapSide::Buy,
        };
        let simulated = self.oracle.simulate(&request).await?;

        // buy prices are token_in per token_out
        self.build_quote(
            SwapSide::Buy,
            snapshot,
            token_in,
            token_out,
            simulated.amount,
            amount_out_raw,
            &simulated,
            !out_is_token0,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_quote(
        &self,
        side: SwapSide,
        snapshot: &PoolSnapshot,
        token_in: &Token,
        token_out: &Token,
        amount_in_raw: U256,
        amount_out_raw: U256,
        simulated: &OracleQuote,
        invert_after: bool,
    ) -> Result<Quote> {
        let state = &snapshot.state;
        let amount_in = from_base_units(amount_in_raw, token_in.decimals)?;
        let amount_out = from_base_units(amount_out_raw, token_out.decimals)?;

        // both prices are quoted in this token and rounded to its unit
        let price_token = match side {
            SwapSide::Sell => token_out,
            SwapSide::Buy => token_in,
        };
        let actual_price = match side {
            SwapSide::Sell => realized_price(amount_out_raw, token_out, amount_in_raw, token_in)?,
            SwapSide::Buy => realized_price(amount_in_raw, token_in, amount_out_raw, token_out)?,
        };
        let actual_price = round_to_token(actual_price, price_token.decimals);

        let price_after = round_to_token(
            decode_price(
                simulated.sqrt_price_x96_after,
                state.token0.decimals,
                state.token1.decimals,
                invert_after,
            )?,
            price_token.decimals,
        );
        let tick_after = tick_at_sqrt_ratio(simulated.sqrt_price_x96_after)?;

        let gas_price_wei = self.gas.gas_price().await?;
        let gas_cost_wei = simulated.gas_units.checked_mul(gas_price_wei).ok_or_else(|| {
            PoolError::CalculationError(format!(
                "Gas cost {} x {gas_price_wei} overflows",
                simulated.gas_units
            ))
        })?;

        let quote = Quote {
            side,
            pool: state.address,
            fee: state.fee,
            token_in: token_in.clone(),
            token_out: token_out.clone(),
            amount_in,
            amount_out,
            amount_in_raw,
            amount_out_raw,
            price_after,
            actual_price,
            sqrt_price_x96_after: simulated.sqrt_price_x96_after,
            tick_after,
            ticks_crossed: simulated.ticks_crossed,
            gas_units: simulated.gas_units,
            gas_price_wei,
            gas_cost_native: wei_to_native(gas_cost_wei)?,
            quoted_at: Utc::now(),
        };

        info!(
            side = side.as_str(),
            pool = ?state.address,
            amount_in = %quote.amount_in,
            token_in = %token_in.symbol,
            amount_out = %quote.amount_out,
            token_out = %token_out.symbol,
            actual_price = %quote.actual_price,
            gas_cost = %quote.gas_cost_native,
            "Quote computed"
        );

        Ok(quote)
    }

    fn record(&self, side: SwapSide, result: &Result<Quote>) {
        if let Some(metrics) = &self.metrics {
            match result {
                Ok(_) => metrics.quote_ok(side),
                Err(_) => metrics.quote_failed(side),
            }
        }
    }
}

fn positive_base_units(amount: Decimal, token: &Token) -> Result<U256> {
    if amount <= Decimal::ZERO {
        return Err(PoolError::InvalidAmount(format!(
            "Amount must be positive, got {amount} {}",
            token.symbol
        )));
    }
    let raw = to_base_units(amount, token.decimals)?;
    if raw.is_zero() {
        return Err(PoolError::InvalidAmount(format!(
            "{amount} {} is below the token's smallest unit",
            token.symbol
        )));
    }
    Ok(raw)
}

/// `numerator / denominator` in human units, computed on the raw integers.
fn realized_price(numerator: U256, num_token: &Token, denominator: U256, den_token: &Token) -> Result<Decimal> {
    ratio_to_decimal(
        &(u256_to_biguint(numerator) * pow10(u32::from(den_token.decimals))),
        &(u256_to_biguint(denominator) * pow10(u32::from(num_token.decimals))),
    )
}
