/*
 * Pool service: one initialized pool with its quote engine and swap executor
 */

use ethers::signers::LocalWallet;
use ethers::types::Address;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use crate::config::{Config, GasSource};
use crate::execution::{validate_slippage, SwapExecutor};
use crate::metrics::Metrics;
use crate::models::{PoolError, Quote, Result, SwapReceipt, Token};
use crate::pool::{PoolState, PoolStateReader, RpcPoolContract};
use crate::quote::{FixedGasPrice, GasPriceSource, QuoteEngine, QuoterV2};
use crate::rpc::RpcClient;

pub struct PoolService {
    reader: Arc<PoolStateReader>,
    engine: Arc<QuoteEngine>,
    executor: SwapExecutor,
    metrics: Arc<Metrics>,
    default_slippage: Decimal,
}

impl PoolService {
    pub async fn new(config: &Config) -> Result<Self> {
        info!("Initializing pool service");

        let rpc = Arc::new(RpcClient::new(&config.chain.rpc_url, config.chain.chain_id).await?);
        info!(chain_id = config.chain.chain_id, "Connected to RPC");

        let contract = Arc::new(RpcPoolContract::new(rpc.clone()));
        let reader = Arc::new(PoolStateReader::initialize(contract, config.pool_address()?).await?);

        let gas: Arc<dyn GasPriceSource> = match config.gas.source {
            GasSource::Rpc => rpc.clone(),
            GasSource::Fixed => Arc::new(FixedGasPrice::from_gwei(config.gas.fixed_gwei)),
        };

        let metrics = Arc::new(Metrics::new()?);
        let oracle = Arc::new(QuoterV2::new(rpc.clone(), config.chain.quoter_address));
        let engine = Arc::new(QuoteEngine::new(oracle, gas.clone()).with_metrics(metrics.clone()));
        let executor = SwapExecutor::new(
            reader.clone(),
            engine.clone(),
            rpc,
            gas,
            config.execution_settings()?,
        )
        .with_metrics(metrics.clone());

        Ok(Self::from_parts(
            reader,
            engine,
            executor,
            metrics,
            config.trading.default_slippage,
        ))
    }

    #[must_use]
    pub fn from_parts(
        reader: Arc<PoolStateReader>,
        engine: Arc<QuoteEngine>,
        executor: SwapExecutor,
        metrics: Arc<Metrics>,
        default_slippage: Decimal,
    ) -> Self {
        Self {
            reader,
            engine,
            executor,
            metrics,
            default_slippage,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &PoolState {
        self.reader.state()
    }

    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Looks a pool token up by address or, failing that, by symbol.
    pub fn resolve_token(&self, token: &str) -> Result<Token> {
        let pool = self.pool();
        match Address::from_str(token) {
            Ok(address) => pool.token(address).cloned().ok_or(PoolError::TokenNotInPool {
                token: address,
                pool: pool.address,
            }),
            Err(_) => pool
                .token_by_symbol(token)
                .cloned()
                .ok_or_else(|| PoolError::UnknownToken(token.to_string())),
        }
    }

    pub async fn current_price(&self, reverse: bool) -> Result<Decimal> {
        let snapshot = self.reader.snapshot().await?;
        self.metrics.observe_price(snapshot.price(false)?);
        snapshot.price(reverse)
    }

    pub async fn quote_sell(&self, token_in: Address, amount_in: Decimal) -> Result<Quote> {
        let snapshot = self.reader.snapshot().await?;
        self.engine.quote_sell(token_in, amount_in, &snapshot).await
    }

    pub async fn quote_buy(&self, token_out: Address, amount_out: Decimal) -> Result<Quote> {
        let snapshot = self.reader.snapshot().await?;
        self.engine.quote_buy(token_out, amount_out, &snapshot).await
    }

    /// Exact-input swap; `slippage` defaults to `trading.default_slippage`.
    pub async fn sell(
        &self,
        token_in: Address,
        amount_in: Decimal,
        recipient: Address,
        wallet: &LocalWallet,
        slippage: Option<Decimal>,
    ) -> Result<SwapReceipt> {
        let slippage = self.slippage_or_default(slippage)?;
        self.executor.sell(token_in, amount_in, recipient, wallet, slippage).await
    }

    /// Exact-output swap; `slippage` defaults to `trading.default_slippage`.
    pub async fn buy(
        &self,
        token_out: Address,
        amount_out: Decimal,
        recipient: Address,
        wallet: &LocalWallet,
        slippage: Option<Decimal>,
    ) -> Result<SwapReceipt> {
        let slippage = self.slippage_or_default(slippage)?;
        self.executor.buy(token_out, amount_out, recipient, wallet, slippage).await
    }

    fn slippage_or_default(&self, slippage: Option<Decimal>) -> Result<Decimal> {
        let slippage = slippage.unwrap_or(self.default_slippage);
        validate_slippage(slippage)?;
        Ok(slippage)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::execution::{ExecutionSettings, RetryPolicy};
    use crate::models::SwapSide;
    use crate::testing::{usdc, weth, FakeChain, FakePool, RecordingOracle, TEST_PRIVATE_KEY};
    use chrono::Duration as ChronoDuration;
    use ethers::types::U256;
    use std::time::Duration;

    pub(crate) async fn service_with(oracle: RecordingOracle, chain: Arc<FakeChain>) -> PoolService {
        let reader = Arc::new(
            PoolStateReader::initialize(Arc::new(FakePool::usdc_weth()), FakePool::ADDRESS)
                .await
                .unwrap(),
        );
        let gas: Arc<dyn GasPriceSource> = Arc::new(FixedGasPrice::from_gwei(20));
        let metrics = Arc::new(Metrics::new().unwrap());
        let engine = Arc::new(QuoteEngine::new(Arc::new(oracle), gas.clone()).with_metrics(metrics.clone()));
        let settings = ExecutionSettings {
            router: Address::repeat_byte(0x68),
            swap_gas_limit: U256::from(300_000u64),
            approve_gas_limit: U256::from(100_000u64),
            deadline: ChronoDuration::minutes(5),
            confirmation_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::none(),
        };
        let executor = SwapExecutor::new(reader.clone(), engine.clone(), chain, gas, settings)
            .with_metrics(metrics.clone());

        PoolService::from_parts(reader, engine, executor, metrics, Decimal::new(5, 3))
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn tokens_resolve_by_address_or_symbol() {
        let chain = Arc::new(FakeChain::funded(U256::zero(), U256::zero()));
        let service = service_with(RecordingOracle::returning(U256::one()), chain).await;

        assert_eq!(service.resolve_token("usdc").unwrap(), usdc());
        assert_eq!(
            service
                .resolve_token("0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2")
                .unwrap(),
            weth()
        );
        assert!(service.resolve_token("DAI").is_err());
        assert!(service
            .resolve_token("0x0000000000000000000000000000000000000001")
            .is_err());
    }

    #[tokio::test]
    async fn current_price_updates_the_gauge() {
        let chain = Arc::new(FakeChain::funded(U256::zero(), U256::zero()));
        let service = service_with(RecordingOracle::returning(U256::one()), chain).await;

        assert_eq!(service.current_price(false).await.unwrap(), dec("0.000034"));
        assert!(service.metrics().render().unwrap().contains("poolhelper_pool_price 0.000034"));
    }

    #[tokio::test(start_paused = true)]
    async fn sell_uses_the_default_slippage() {
        let chain = Arc::new(FakeChain::funded(U256::from(2_000_000_000u64), U256::MAX));
        let oracle = RecordingOracle::returning(U256::from(33_631_070_000_000_000u64));
        let service = service_with(oracle, chain.clone()).await;
        let wallet: LocalWallet = TEST_PRIVATE_KEY.parse().unwrap();

        let receipt = service
            .sell(usdc().address, dec("1000"), Address::repeat_byte(0x11), &wallet, None)
            .await
            .unwrap();

        assert_eq!(receipt.side, SwapSide::Sell);
        assert_eq!(receipt.limit, dec("0.03346291465"));
        assert_eq!(chain.sent().len(), 1);
    }

    #[tokio::test]
    async fn explicit_slippage_is_validated() {
        let chain = Arc::new(FakeChain::funded(U256::MAX, U256::MAX));
        let service = service_with(RecordingOracle::returning(U256::one()), chain.clone()).await;
        let wallet: LocalWallet = TEST_PRIVATE_KEY.parse().unwrap();

        let result = service
            .buy(weth().address, dec("1"), Address::repeat_byte(0x11), &wallet, Some(dec("1.2")))
            .await;
        assert!(matches!(result, Err(PoolError::InvalidSlippage(_))));
        assert_eq!(chain.send_attempts(), 0);
    }
}
