/*
 * QuoterV2 simulation over eth_call
 */

use async_trait::async_trait;
use ethers::abi::{decode, ParamType, Token as AbiToken};
use ethers::types::{Address, U256};
use std::sync::Arc;
use crate::models::{PoolError, Result, SwapSide};
use crate::rpc::{encode_call, RpcClient};
use super::{OracleQuote, OracleRequest, QuotingOracle};

const QUOTE_EXACT_INPUT_SINGLE: &str =
    "quoteExactInputSingle((address,address,uint256,uint24,uint160))";
const QUOTE_EXACT_OUTPUT_SINGLE: &str =
    "quoteExactOutputSingle((address,address,uint256,uint24,uint160))";

pub struct QuoterV2 {
    rpc: Arc<RpcClient>,
    address: Address,
}

impl QuoterV2 {
    #[must_use]
    pub fn new(rpc: Arc<RpcClient>, address: Address) -> Self {
        Self { rpc, address }
    }
}

/// Calldata for the single-pool QuoterV2 entry points. Both take
/// `(tokenIn, tokenOut, amount, fee, sqrtPriceLimitX96)`.
#[must_use]
pub fn encode_quote_call(request: &OracleRequest) -> Vec<u8> {
    let signature = match request.side {
        SwapSide::Sell => QUOTE_EXACT_INPUT_SINGLE,
        SwapSide::Buy => QUOTE_EXACT_OUTPUT_SINGLE,
    };
    encode_call(
        signature,
        &[AbiToken::Tuple(vec![
            AbiToken::Address(request.token_in),
            AbiToken::Address(request.token_out),
            AbiToken::Uint(request.amount),
            AbiToken::Uint(U256::from(request.fee)),
            AbiToken::Uint(U256::zero()),
        ])],
    )
}

/// `(amount, sqrtPriceX96After, initializedTicksCrossed, gasEstimate)`
pub fn decode_quote_result(data: &[u8]) -> Result<OracleQuote> {
    let tokens = decode(
        &[
            ParamType::Uint(256),
            ParamType::Uint(160),
            ParamType::Uint(32),
            ParamType::Uint(256),
        ],
        data,
    )
    .map_err(|e| PoolError::ContractError(format!("Invalid quoter response: {e}")))?;

    let mut words = tokens.into_iter().map(|t| match t {
        AbiToken::Uint(v) => Ok(v),
        other => Err(PoolError::ContractError(format!(
            "Unexpected quoter field {other:?}"
        ))),
    });
    let mut next = || {
        words
            .next()
            .unwrap_or_else(|| Err(PoolError::ContractError("Truncated quoter response".into())))
    };

    let amount = next()?;
    let sqrt_price_x96_after = next()?;
    let ticks_crossed = next()?.low_u32();
    let gas_units = next()?;

    Ok(OracleQuote {
        amount,
        sqrt_price_x96_after,
        ticks_crossed,
        gas_units,
    })
}

#[async_trait]
impl QuotingOracle for QuoterV2 {
    async fn simulate(&self, request: &OracleRequest) -> Result<OracleQuote> {
        let data = encode_quote_call(request);
        let result = self
            .rpc
            .call(self.address, data, None)
            .await
            .map_err(|e| match e {
                // the quoter reverts when the pool cannot fill the amount
                PoolError::ContractError(reason) => PoolError::InsufficientLiquidity(format!(
                    "{} {} of {:?} -> {:?}: {reason}",
                    request.side.as_str(),
                    request.amount,
                    request.token_in,
                    request.token_out
                )),
                other => other,
            })?;
        decode_quote_result(&result)
    }
}
