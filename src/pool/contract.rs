/*
 * Uniswap V3 pool and ERC-20 reads over JSON-RPC
 */

use async_trait::async_trait;
use ethers::abi::{decode, ParamType, Token as AbiToken};
use ethers::types::{Address, U256};
use std::sync::Arc;
use crate::models::{PoolError, Result, Token};
use crate::rpc::{decode_uint, encode_call, RpcClient};
use super::{PoolContract, PoolImmutables, Slot0};

pub struct RpcPoolContract {
    rpc: Arc<RpcClient>,
}

impl RpcPoolContract {
    #[must_use]
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        Self { rpc }
    }

    async fn read_word(&self, target: Address, signature: &str) -> Result<Vec<u8>> {
        let result = self.rpc.call(target, encode_call(signature, &[]), None).await?;
        if result.len() < 32 {
            return Err(PoolError::ContractError(format!(
                "Invalid {signature} response from {target:?}"
            )));
        }
        Ok(result.to_vec())
    }

    async fn read_address(&self, target: Address, signature: &str) -> Result<Address> {
        let word = self.read_word(target, signature).await?;
        Ok(Address::from_slice(&word[12..32]))
    }
}

fn not_a_pool(pool: Address) -> impl Fn(PoolError) -> PoolError {
    move |e| match e {
        PoolError::ContractError(reason) => PoolError::PoolNotFound { pool, reason },
        other => other,
    }
}

#[async_trait]
impl PoolContract for RpcPoolContract {
    async fn immutables(&self, pool: Address) -> Result<PoolImmutables> {
        if !self.rpc.has_code(pool).await? {
            return Err(PoolError::PoolNotFound {
                pool,
                reason: "no contract deployed at this address".to_string(),
            });
        }

        let (token0, token1, fee, spacing) = tokio::try_join!(
            self.read_address(pool, "token0()"),
            self.read_address(pool, "token1()"),
            self.read_word(pool, "fee()"),
            self.read_word(pool, "tickSpacing()"),
        )
        .map_err(not_a_pool(pool))?;

        let fee = decode_uint(&fee, "fee")?;
        if fee > U256::from(1_000_000u32) {
            return Err(PoolError::PoolNotFound {
                pool,
                reason: format!("fee() returned {fee}, not a fee tier"),
            });
        }

        Ok(PoolImmutables {
            token0,
            token1,
            fee: fee.as_u32(),
            tick_spacing: word_to_i32(&spacing),
        })
    }

    async fn token_metadata(&self, token: Address) -> Result<Token> {
        let (decimals, symbol) = tokio::try_join!(
            self.read_word(token, "decimals()"),
            self.rpc.call(token, encode_call("symbol()", &[]), None),
        )?;

        let decimals = decode_uint(&decimals, "decimals")?;
        if decimals > U256::from(u8::MAX) {
            return Err(PoolError::ContractError(format!(
                "Token {token:?} reports {decimals} decimals"
            )));
        }

        Ok(Token::new(token, decimals.as_u32() as u8, decode_symbol(&symbol)?))
    }

    async fn slot0(&self, pool: Address) -> Result<Slot0> {
        let result = self.rpc.call(pool, encode_call("slot0()", &[]), None).await?;
        if result.len() < 64 {
            return Err(PoolError::ContractError(format!(
                "Invalid slot0 response from {pool:?}"
            )));
        }

        Ok(Slot0 {
            sqrt_price_x96: U256::from_big_endian(&result[0..32]),
            tick: word_to_i32(&result[32..64]),
        })
    }

    async fn liquidity(&self, pool: Address) -> Result<u128> {
        let word = self.read_word(pool, "liquidity()").await?;
        Ok(U256::from_big_endian(&word[0..32]).low_u128())
    }
}

/// Signed ABI words are sign-extended, so the low four bytes hold an int24 intact.
fn word_to_i32(word: &[u8]) -> i32 {
    i32::from_be_bytes([word[28], word[29], word[30], word[31]])
}

/// ERC-20 `symbol()` as `string`, falling back to the legacy `bytes32` layout.
pub(crate) fn decode_symbol(data: &[u8]) -> Result<String> {
    if let Ok(tokens) = decode(&[ParamType::String], data) {
        if let Some(AbiToken::String(symbol)) = tokens.into_iter().next() {
            return Ok(symbol);
        }
    }

    if data.len() == 32 {
        let end = data.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        return String::from_utf8(data[..end].to_vec())
            .map_err(|e| PoolError::ContractError(format!("Invalid bytes32 symbol: {e}")));
    }

    Err(PoolError::ContractError(format!(
        "Unrecognised symbol() response of {} bytes",
        data.len()
    )))
}
