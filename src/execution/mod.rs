/*
 * Swap executor: slippage-bounded SwapRouter02 swaps from quote to confirmation
 */

pub mod calldata;
pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, Bytes, TransactionRequest, H256, U256,
};
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use crate::metrics::Metrics;
use crate::models::{PoolError, Quote, Result, SwapReceipt, SwapSide, TxStatus};
use crate::pool::PoolStateReader;
use crate::quote::{GasPriceSource, QuoteEngine};
use crate::utils::{round_to_token, to_base_units};

pub use calldata::{encode_approve, encode_exact_input_single, encode_exact_output_single, encode_multicall};
pub use retry::RetryPolicy;

/// The chain operations a swap needs, from nonce lookup to receipt polling.
#[async_trait]
pub trait SwapChain: Send + Sync {
    fn chain_id(&self) -> u64;
    async fn pending_nonce(&self, owner: Address) -> Result<U256>;
    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256>;
    async fn token_allowance(&self, token: Address, owner: Address, spender: Address) -> Result<U256>;
    /// Returns the transaction hash once the node accepted the payload.
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256>;
    async fn transaction_status(&self, tx_hash: H256) -> Result<TxStatus>;
    async fn revert_reason(&self, tx_hash: H256) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapStage {
    Built,
    Signed,
    Submitted,
    Confirmed,
    Reverted,
    TimedOut,
}

impl fmt::Display for SwapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwapStage::Built => "built",
            SwapStage::Signed => "signed",
            SwapStage::Submitted => "submitted",
            SwapStage::Confirmed => "confirmed",
            SwapStage::Reverted => "reverted",
            SwapStage::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// The bound a swap is allowed to settle at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapLimit {
    MinimumOut(Decimal),
    MaximumIn(Decimal),
}

impl SwapLimit {
    #[must_use]
    pub fn amount(&self) -> Decimal {
        match self {
            SwapLimit::MinimumOut(v) | SwapLimit::MaximumIn(v) => *v,
        }
    }
}

pub fn validate_slippage(slippage: Decimal) -> Result<()> {
    if slippage < Decimal::ZERO || slippage >= Decimal::ONE {
        return Err(PoolError::InvalidSlippage(slippage));
    }
    Ok(())
}

/// `amount_out * (1 - slippage)`, round-half-even at the token's unit.
pub fn min_amount_out(amount_out: Decimal, slippage: Decimal, decimals: u8) -> Result<Decimal> {
    validate_slippage(slippage)?;
    let bound = amount_out
        .checked_mul(Decimal::ONE - slippage)
        .ok_or_else(|| PoolError::CalculationError(format!("{amount_out} x (1 - {slippage}) overflows")))?;
    Ok(round_to_token(bound, decimals))
}

/// `amount_in * (1 + slippage)`, round-half-even at the token's unit.
pub fn max_amount_in(amount_in: Decimal, slippage: Decimal, decimals: u8) -> Result<Decimal> {
    validate_slippage(slippage)?;
    let bound = amount_in
        .checked_mul(Decimal::ONE + slippage)
        .ok_or_else(|| PoolError::CalculationError(format!("{amount_in} x (1 + {slippage}) overflows")))?;
    Ok(round_to_token(bound, decimals))
}

/// A quote the caller has approved, with the terms it may execute under.
#[derive(Debug, Clone)]
pub struct SwapRequest {
    pub quote: Quote,
    pub slippage: Decimal,
    pub recipient: Address,
    pub deadline: DateTime<Utc>,
}

impl SwapRequest {
    pub fn new(quote: Quote, slippage: Decimal, recipient: Address, deadline: DateTime<Utc>) -> Result<Self> {
        validate_slippage(slippage)?;
        Ok(Self {
            quote,
            slippage,
            recipient,
            deadline,
        })
    }

    pub fn limit(&self) -> Result<SwapLimit> {
        match self.quote.side {
            SwapSide::Sell => Ok(SwapLimit::MinimumOut(min_amount_out(
                self.quote.amount_out,
                self.slippage,
                self.quote.token_out.decimals,
            )?)),
            SwapSide::Buy => Ok(SwapLimit::MaximumIn(max_amount_in(
                self.quote.amount_in,
                self.slippage,
                self.quote.token_in.decimals,
            )?)),
        }
    }

    /// The limit in raw units of the token it applies to.
    pub fn limit_raw(&self) -> Result<U256> {
        match self.limit()? {
            SwapLimit::MinimumOut(v) => to_base_units(v, self.quote.token_out.decimals),
            SwapLimit::MaximumIn(v) => to_base_units(v, self.quote.token_in.decimals),
        }
    }

    /// Raw amount of `token_in` the owner must hold and approve.
    pub fn required_input_raw(&self) -> Result<U256> {
        match self.quote.side {
            SwapSide::Sell => Ok(self.quote.amount_in_raw),
            SwapSide::Buy => self.limit_raw(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub router: Address,
    pub swap_gas_limit: U256,
    pub approve_gas_limit: U256,
    /// How far in the future `sell`/`buy` place the deadline.
    pub deadline: ChronoDuration,
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

struct Confirmation {
    tx_hash: H256,
    block_number: u64,
    gas_used: U256,
}

pub struct SwapExecutor {
    reader: Arc<PoolStateReader>,
    engine: Arc<QuoteEngine>,
    chain: Arc<dyn SwapChain>,
    gas: Arc<dyn GasPriceSource>,
    settings: ExecutionSettings,
    metrics: Option<Arc<Metrics>>,
}

impl SwapExecutor {
    #[must_use]
    pub fn new(
        reader: Arc<PoolStateReader>,
        engine: Arc<QuoteEngine>,
        chain: Arc<dyn SwapChain>,
        gas: Arc<dyn GasPriceSource>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            reader,
            engine,
            chain,
            gas,
            settings,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Quotes and executes an exact-input swap of `amount_in` of `token_in`.
    pub async fn sell(
        &self,
        token_in: Address,
        amount_in: Decimal,
        recipient: Address,
        wallet: &LocalWallet,
        slippage: Decimal,
    ) -> Result<SwapReceipt> {
        validate_slippage(slippage)?;
        let snapshot = self.reader.snapshot().await?;
        let quote = self.engine.quote_sell(token_in, amount_in, &snapshot).await?;
        let request = SwapRequest::new(quote, slippage, recipient, Utc::now() + self.settings.deadline)?;
        self.execute(&request, wallet).await
    }

    /// Quotes and executes an exact-output swap receiving `amount_out` of `token_out`.
    pub async fn buy(
        &self,
        token_out: Address,
        amount_out: Decimal,
        recipient: Address,
        wallet: &LocalWallet,
        slippage: Decimal,
    ) -> Result<SwapReceipt> {
        validate_slippage(slippage)?;
        let snapshot = self.reader.snapshot().await?;
        let quote = self.engine.quote_buy(token_out, amount_out, &snapshot).await?;
        let request = SwapRequest::new(quote, slippage, recipient, Utc::now() + self.settings.deadline)?;
        self.execute(&request, wallet).await
    }

    /// Executes an approved request. The swap itself is submitted at most once:
    /// a revert or timeout is reported, never retried.
    pub async fn execute(&self, request: &SwapRequest, wallet: &LocalWallet) -> Result<SwapReceipt> {
        let side = request.quote.side;
        // an approval that reverts or times out never sends the swap
        let (result, swap_sent) = match self.prepare_swap(request, wallet).await {
            Ok(data) => (self.submit_swap(request, data, wallet).await, true),
            Err(e) => (Err(e), false),
        };

        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(_) => SwapStage::Confirmed.to_string(),
                Err(PoolError::Reverted { .. }) if swap_sent => SwapStage::Reverted.to_string(),
                Err(PoolError::TimedOut { .. }) if swap_sent => SwapStage::TimedOut.to_string(),
                Err(_) => "rejected".to_string(),
            };
            metrics.swap_finished(side, &outcome);
        }
        result
    }

    /// Every pre-trade check plus the approval; returns the router calldata.
    async fn prepare_swap(&self, request: &SwapRequest, wallet: &LocalWallet) -> Result<Vec<u8>> {
        let quote = &request.quote;
        if Utc::now() >= request.deadline {
            return Err(PoolError::DeadlineExpired(request.deadline));
        }

        let limit_raw = request.limit_raw()?;
        let required = request.required_input_raw()?;

        self.check_still_within_limit(request, limit_raw).await?;

        let owner = wallet.address();
        let balance = self.chain.token_balance(quote.token_in.address, owner).await?;
        if balance < required {
            return Err(PoolError::InsufficientBalance {
                symbol: quote.token_in.symbol.clone(),
                available: balance,
                required,
            });
        }

        self.ensure_allowance(quote.token_in.address, required, wallet).await?;

        let deadline = U256::from(request.deadline.timestamp().max(0) as u64);
        let inner = match quote.side {
            SwapSide::Sell => encode_exact_input_single(
                quote.token_in.address,
                quote.token_out.address,
                quote.fee,
                request.recipient,
                quote.amount_in_raw,
                limit_raw,
            ),
            SwapSide::Buy => encode_exact_output_single(
                quote.token_in.address,
                quote.token_out.address,
                quote.fee,
                request.recipient,
                quote.amount_out_raw,
                limit_raw,
            ),
        };
        Ok(encode_multicall(deadline, vec![inner]))
    }

    async fn submit_swap(&self, request: &SwapRequest, data: Vec<u8>, wallet: &LocalWallet) -> Result<SwapReceipt> {
        let quote = &request.quote;
        let limit = request.limit()?;

        info!(
            side = quote.side.as_str(),
            pool = ?quote.pool,
            amount_in = %quote.amount_in,
            amount_out = %quote.amount_out,
            limit = %limit.amount(),
            deadline = %request.deadline,
            "Executing swap"
        );

        let confirmation = self
            .submit_and_confirm(wallet, self.settings.router, data, self.settings.swap_gas_limit)
            .await?;

        Ok(SwapReceipt {
            tx_hash: confirmation.tx_hash,
            side: quote.side,
            block_number: confirmation.block_number,
            gas_used: confirmation.gas_used,
            quote: quote.clone(),
            limit: limit.amount(),
        })
    }

    /// Re-simulates against a fresh snapshot so a swap that would certainly
    /// revert on its bound is never signed.
    async fn check_still_within_limit(&self, request: &SwapRequest, limit_raw: U256) -> Result<()> {
        let quote = &request.quote;
        let snapshot = self.reader.snapshot().await?;

        match quote.side {
            SwapSide::Sell => {
                let fresh = self
                    .engine
                    .quote_sell(quote.token_in.address, quote.amount_in, &snapshot)
                    .await?;
                if fresh.amount_out_raw < limit_raw {
                    return Err(PoolError::SlippageExceeded(format!(
                        "selling {} {} now returns {} {}, below the minimum of {}",
                        quote.amount_in,
                        quote.token_in.symbol,
                        fresh.amount_out,
                        quote.token_out.symbol,
                        request.limit()?.amount()
                    )));
                }
            }
            SwapSide::Buy => {
                let fresh = self
                    .engine
                    .quote_buy(quote.token_out.address, quote.amount_out, &snapshot)
                    .await?;
                if fresh.amount_in_raw > limit_raw {
                    return Err(PoolError::SlippageExceeded(format!(
                        "buying {} {} now costs {} {}, above the maximum of {}",
                        quote.amount_out,
                        quote.token_out.symbol,
                        fresh.amount_in,
                        quote.token_in.symbol,
                        request.limit()?.amount()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Approves the router for exactly `required` when the current allowance is short.
    async fn ensure_allowance(&self, token: Address, required: U256, wallet: &LocalWallet) -> Result<Option<H256>> {
        let router = self.settings.router;
        let allowance = self
            .chain
            .token_allowance(token, wallet.address(), router)
            .await?;
        if allowance >= required {
            debug!(token = ?token, allowance = %allowance, "Allowance sufficient");
            return Ok(None);
        }

        // TODO: tokens like USDT reject a non-zero to non-zero allowance change; reset to 0 first
        info!(token = ?token, allowance = %allowance, required = %required, "Approving router");
        let data = encode_approve(router, required);
        let confirmation = self
            .submit_and_confirm(wallet, token, data, self.settings.approve_gas_limit)
            .await?;
        Ok(Some(confirmation.tx_hash))
    }

    async fn submit_and_confirm(
        &self,
        wallet: &LocalWallet,
        to: Address,
        data: Vec<u8>,
        gas_limit: U256,
    ) -> Result<Confirmation> {
        let owner = wallet.address();
        let chain_id = self.chain.chain_id();

        let nonce = self
            .settings
            .retry
            .run("pending_nonce", || self.chain.pending_nonce(owner))
            .await?;
        let gas_price = self.gas.gas_price().await?;

        let tx: TypedTransaction = TransactionRequest::new()
            .from(owner)
            .to(to)
            .data(Bytes::from(data))
            .value(U256::zero())
            .gas(gas_limit)
            .gas_price(gas_price)
            .nonce(nonce)
            .chain_id(chain_id)
            .into();
        debug!(stage = %SwapStage::Built, to = ?to, nonce = %nonce, gas_price = %gas_price, "Transaction built");

        let signature = wallet
            .clone()
            .with_chain_id(chain_id)
            .sign_transaction(&tx)
            .await
            .map_err(|e| PoolError::Signing(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        debug!(stage = %SwapStage::Signed, "Transaction signed");

        // only the identical signed payload is ever resent
        let tx_hash = self
            .settings
            .retry
            .run("send_raw_transaction", || self.chain.send_raw_transaction(raw.clone()))
            .await?;
        info!(stage = %SwapStage::Submitted, tx_hash = ?tx_hash, nonce = %nonce, "Transaction submitted");

        self.wait_for_confirmation(tx_hash).await
    }

    /// Polls until the transaction is included or the confirmation timeout
    /// passes. A timeout leaves the transaction in the mempool.
    async fn wait_for_confirmation(&self, tx_hash: H256) -> Result<Confirmation> {
        let timeout = self.settings.confirmation_timeout;
        let started = Instant::now();

        loop {
            match self.chain.transaction_status(tx_hash).await {
                Ok(TxStatus::Success { block_number, gas_used }) => {
                    info!(stage = %SwapStage::Confirmed, tx_hash = ?tx_hash, block_number, gas_used = %gas_used, "Transaction confirmed");
                    return Ok(Confirmation {
                        tx_hash,
                        block_number,
                        gas_used,
                    });
                }
                Ok(TxStatus::Reverted { block_number }) => {
                    let reason = match self.chain.revert_reason(tx_hash).await {
                        Ok(reason) => reason,
                        Err(e) => {
                            warn!(tx_hash = ?tx_hash, error = %e, "Could not recover revert reason");
                            None
                        }
                    };
                    warn!(stage = %SwapStage::Reverted, tx_hash = ?tx_hash, block_number, reason = ?reason, "Transaction reverted");
                    return Err(PoolError::Reverted { tx_hash, reason });
                }
                Ok(TxStatus::Pending) => {}
                Err(e) if e.is_transient() => {
                    warn!(tx_hash = ?tx_hash, error = %e, "Receipt poll failed");
                }
                Err(e) => return Err(e),
            }

            if started.elapsed() >= timeout {
                warn!(stage = %SwapStage::TimedOut, tx_hash = ?tx_hash, waited_secs = timeout.as_secs(), "Transaction not confirmed in time");
                return Err(PoolError::TimedOut {
                    tx_hash,
                    waited_secs: timeout.as_secs(),
                });
            }
            sleep(self.settings.poll_interval).await;
        }
    }
}
