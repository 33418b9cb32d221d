/*
 * In-memory stand-ins for the chain, the quoter and the subgraph
 */

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, Bytes, H160, H256, U256};
use ethers::utils::keccak256;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use crate::execution::SwapChain;
use crate::ingest::{SwapPageQuery, SwapQueryService, SwapRecord};
use crate::models::{PoolError, Result, SwapSide, Token, TxStatus};
use crate::pool::{PoolContract, PoolImmutables, PoolSnapshot, PoolState, Slot0};
use crate::quote::{OracleQuote, OracleRequest, QuotingOracle};

/// 1 USDC = 0.000034 WETH
pub const USDC_WETH_SQRT_PRICE: &str = "461975604337661044387532051900495";

pub const USDC: Address = H160([
    0xa0, 0xb8, 0x69, 0x91, 0xc6, 0x21, 0x8b, 0x36, 0xc1, 0xd1, 0x9d, 0x4a, 0x2e, 0x9e, 0xb0, 0xce,
    0x36, 0x06, 0xeb, 0x48,
]);
pub const WETH: Address = H160([
    0xc0, 0x2a, 0xaa, 0x39, 0xb2, 0x23, 0xfe, 0x8d, 0x0a, 0x0e, 0x5c, 0x4f, 0x27, 0xea, 0xd9, 0x08,
    0x3c, 0x75, 0x6c, 0xc2,
]);

/// Hardhat/anvil account #0.
pub const TEST_PRIVATE_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub fn usdc() -> Token {
    Token::new(USDC, 6, "USDC")
}

pub fn weth() -> Token {
    Token::new(WETH, 18, "WETH")
}

pub fn usdc_weth_sqrt() -> U256 {
    U256::from_dec_str(USDC_WETH_SQRT_PRICE).unwrap()
}

pub fn pool_state() -> PoolState {
    PoolState {
        address: FakePool::ADDRESS,
        token0: usdc(),
        token1: weth(),
        fee: 500,
        tick_spacing: 10,
    }
}

pub fn snapshot() -> PoolSnapshot {
    PoolSnapshot {
        state: pool_state(),
        sqrt_price_x96: usdc_weth_sqrt(),
        tick: 173_427,
        liquidity: 12_345_678_901_234_567_890,
        taken_at: Utc::now(),
    }
}

pub struct FakePool {
    slot0: Mutex<Slot0>,
    metadata_reads: Mutex<usize>,
    failures: Mutex<usize>,
}

impl FakePool {
    /// USDC/WETH 0.05% on mainnet
    pub const ADDRESS: Address = H160([
        0x88, 0xe6, 0xa0, 0xc2, 0xdd, 0xd2, 0x6f, 0xee, 0xb6, 0x4f, 0x03, 0x9a, 0x2c, 0x41, 0x29,
        0x6f, 0xcb, 0x3f, 0x56, 0x40,
    ]);

    pub fn usdc_weth() -> Self {
        Self {
            slot0: Mutex::new(Slot0 {
                sqrt_price_x96: usdc_weth_sqrt(),
                tick: 173_427,
            }),
            metadata_reads: Mutex::new(0),
            failures: Mutex::new(0),
        }
    }

    pub fn set_slot0(&self, sqrt_price_x96: U256, tick: i32) {
        *self.slot0.lock().unwrap() = Slot0 { sqrt_price_x96, tick };
    }

    pub fn fail_next_reads(&self, count: usize) {
        *self.failures.lock().unwrap() = count;
    }

    pub fn metadata_reads(&self) -> usize {
        *self.metadata_reads.lock().unwrap()
    }
}

#[async_trait]
impl PoolContract for FakePool {
    async fn immutables(&self, pool: Address) -> Result<PoolImmutables> {
        if pool != Self::ADDRESS {
            return Err(PoolError::PoolNotFound {
                pool,
                reason: "no contract deployed at this address".into(),
            });
        }
        Ok(PoolImmutables {
            token0: USDC,
            token1: WETH,
            fee: 500,
            tick_spacing: 10,
        })
    }

    async fn token_metadata(&self, token: Address) -> Result<Token> {
        *self.metadata_reads.lock().unwrap() += 1;
        match token {
            t if t == USDC => Ok(usdc()),
            t if t == WETH => Ok(weth()),
            other => Err(PoolError::ContractError(format!("{other:?} is not an ERC-20"))),
        }
    }

    async fn slot0(&self, _pool: Address) -> Result<Slot0> {
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(PoolError::NetworkUnavailable("connection reset".into()));
        }
        Ok(*self.slot0.lock().unwrap())
    }

    async fn liquidity(&self, _pool: Address) -> Result<u128> {
        Ok(12_345_678_901_234_567_890)
    }
}

#[derive(Default)]
struct OracleState {
    amount: U256,
    fail_with_liquidity: bool,
    requests: Vec<OracleRequest>,
}

/// Returns a fixed counter-amount and records every request.
#[derive(Clone, Default)]
pub struct RecordingOracle {
    state: Arc<Mutex<OracleState>>,
}

impl RecordingOracle {
    pub fn returning(amount: U256) -> Self {
        let oracle = Self::default();
        oracle.set_amount(amount);
        oracle
    }

    pub fn without_liquidity() -> Self {
        let oracle = Self::default();
        oracle.state.lock().unwrap().fail_with_liquidity = true;
        oracle
    }

    pub fn set_amount(&self, amount: U256) {
        self.state.lock().unwrap().amount = amount;
    }

    pub fn requests(&self) -> Vec<OracleRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl QuotingOracle for RecordingOracle {
    async fn simulate(&self, request: &OracleRequest) -> Result<OracleQuote> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        if state.fail_with_liquidity {
            return Err(PoolError::InsufficientLiquidity("SPL".into()));
        }
        Ok(OracleQuote {
            amount: state.amount,
            sqrt_price_x96_after: usdc_weth_sqrt(),
            ticks_crossed: 0,
            gas_units: U256::from(100_000u64),
        })
    }
}

/// Fills every size at 1 USDC = 0.000034 WETH less a 0.05% fee.
pub struct ConstantPriceOracle {
    /// raw WETH per raw USDC, before fees
    rate: U256,
    fee_pips: U256,
}

impl ConstantPriceOracle {
    pub fn usdc_weth() -> Self {
        Self {
            rate: U256::from(34_000_000u64),
            fee_pips: U256::from(500u64),
        }
    }
}

#[async_trait]
impl QuotingOracle for ConstantPriceOracle {
    async fn simulate(&self, request: &OracleRequest) -> Result<OracleQuote> {
        let million = U256::from(1_000_000u64);
        let kept = million - self.fee_pips;
        let usdc_in = request.token_in == USDC;

        let amount = match (request.side, usdc_in) {
            (SwapSide::Sell, true) => request.amount * self.rate * kept / million,
            (SwapSide::Sell, false) => request.amount * kept / (self.rate * million),
            (SwapSide::Buy, true) => ceil_div(request.amount * million, self.rate * kept),
            (SwapSide::Buy, false) => ceil_div(request.amount * self.rate * million, kept),
        };

        Ok(OracleQuote {
            amount,
            sqrt_price_x96_after: usdc_weth_sqrt(),
            ticks_crossed: 0,
            gas_units: U256::from(100_000u64),
        })
    }
}

fn ceil_div(a: U256, b: U256) -> U256 {
    (a + b - 1) / b
}

pub struct ChainState {
    pub balance: U256,
    pub allowance: U256,
    pub nonce: u64,
    /// Popped one per send attempt before any send succeeds.
    pub send_failures: VecDeque<PoolError>,
    /// Polls answered with `Pending` before `outcome` is reported.
    pub pending_polls: usize,
    pub outcome: TxStatus,
    pub revert_reason: Option<String>,
    pub sent: Vec<Bytes>,
    pub send_attempts: usize,
    pub status_polls: usize,
}

pub struct FakeChain {
    pub state: Mutex<ChainState>,
}

impl FakeChain {
    pub const CHAIN_ID: u64 = 1;

    pub fn funded(balance: U256, allowance: U256) -> Self {
        Self {
            state: Mutex::new(ChainState {
                balance,
                allowance,
                nonce: 7,
                send_failures: VecDeque::new(),
                pending_polls: 1,
                outcome: TxStatus::Success {
                    block_number: 19_000_000,
                    gas_used: U256::from(127_000u64),
                },
                revert_reason: None,
                sent: Vec::new(),
                send_attempts: 0,
                status_polls: 0,
            }),
        }
    }

    pub fn configure(self, f: impl FnOnce(&mut ChainState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.state.lock().unwrap().send_attempts
    }
}

#[async_trait]
impl SwapChain for FakeChain {
    fn chain_id(&self) -> u64 {
        Self::CHAIN_ID
    }

    async fn pending_nonce(&self, _owner: Address) -> Result<U256> {
        Ok(U256::from(self.state.lock().unwrap().nonce))
    }

    async fn token_balance(&self, _token: Address, _owner: Address) -> Result<U256> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn token_allowance(&self, _token: Address, _owner: Address, _spender: Address) -> Result<U256> {
        Ok(self.state.lock().unwrap().allowance)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
        let mut state = self.state.lock().unwrap();
        state.send_attempts += 1;
        if let Some(err) = state.send_failures.pop_front() {
            return Err(err);
        }
        let hash = H256::from(keccak256(&raw));
        state.sent.push(raw);
        state.nonce += 1;
        Ok(hash)
    }

    async fn transaction_status(&self, _tx_hash: H256) -> Result<TxStatus> {
        let mut state = self.state.lock().unwrap();
        state.status_polls += 1;
        if state.pending_polls > 0 {
            state.pending_polls -= 1;
            return Ok(TxStatus::Pending);
        }
        Ok(state.outcome.clone())
    }

    async fn revert_reason(&self, _tx_hash: H256) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().revert_reason.clone())
    }
}

/// `n` swaps 12 seconds apart, ids `0xswap#i`.
pub fn swap_records(n: usize) -> Vec<SwapRecord> {
    (0..n)
        .map(|i| SwapRecord {
            id: format!("0xswap#{i}"),
            timestamp: 1_620_000_000 + 12 * i as u64,
            sqrt_price_x96: usdc_weth_sqrt() + U256::from(i),
            amount0: Decimal::from_str("-1000.123456").unwrap() + Decimal::from(i),
            amount1: Decimal::from_str("0.034004197461239001").unwrap(),
            amount_usd: Decimal::from_str("1000.1234567890123456789").unwrap(),
            tick: 173_427 - i as i32,
        })
        .collect()
}

struct SwapServiceState {
    requests: Vec<SwapPageQuery>,
    fail_at: Option<usize>,
}

/// Serves a static, timestamp-ordered dataset by offset.
pub struct FakeSwapService {
    dataset: Vec<SwapRecord>,
    state: Mutex<SwapServiceState>,
}

impl FakeSwapService {
    pub fn new(dataset: Vec<SwapRecord>) -> Self {
        Self {
            dataset,
            state: Mutex::new(SwapServiceState {
                requests: Vec::new(),
                fail_at: None,
            }),
        }
    }

    /// The request with this 0-based index fails with a transient error.
    pub fn failing_at_request(self, index: usize) -> Self {
        self.state.lock().unwrap().fail_at = Some(index);
        self
    }

    pub fn requests(&self) -> Vec<SwapPageQuery> {
        self.state.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl SwapQueryService for FakeSwapService {
    async fn fetch_swaps(&self, query: &SwapPageQuery) -> Result<Vec<SwapRecord>> {
        let mut state = self.state.lock().unwrap();
        let index = state.requests.len();
        state.requests.push(query.clone());
        if state.fail_at == Some(index) {
            return Err(PoolError::NetworkUnavailable("subgraph timed out".into()));
        }

        Ok(self
            .dataset
            .iter()
            .skip(query.skip)
            .take(query.first)
            .cloned()
            .collect())
    }
}
