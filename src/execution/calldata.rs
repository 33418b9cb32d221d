/*
 * SwapRouter02 and ERC-20 calldata
 */

use ethers::abi::Token as AbiToken;
use ethers::types::{Address, U256};
use crate::rpc::encode_call;

const EXACT_INPUT_SINGLE: &str = "exactInputSingle((address,address,uint24,address,uint256,uint256,uint160))";
const EXACT_OUTPUT_SINGLE: &str = "exactOutputSingle((address,address,uint24,address,uint256,uint256,uint160))";
const MULTICALL_WITH_DEADLINE: &str = "multicall(uint256,bytes[])";

fn single_params(
    token_in: Address,
    token_out: Address,
    fee: u32,
    recipient: Address,
    amount: U256,
    limit: U256,
) -> AbiToken {
    AbiToken::Tuple(vec![
        AbiToken::Address(token_in),
        AbiToken::Address(token_out),
        AbiToken::Uint(U256::from(fee)),
        AbiToken::Address(recipient),
        AbiToken::Uint(amount),
        AbiToken::Uint(limit),
        // no price limit
        AbiToken::Uint(U256::zero()),
    ])
}

#[must_use]
pub fn encode_exact_input_single(
    token_in: Address,
    token_out: Address,
    fee: u32,
    recipient: Address,
    amount_in: U256,
    amount_out_minimum: U256,
) -> Vec<u8> {
    encode_call(
        EXACT_INPUT_SINGLE,
        &[single_params(token_in, token_out, fee, recipient, amount_in, amount_out_minimum)],
    )
}

#[must_use]
pub fn encode_exact_output_single(
    token_in: Address,
    token_out: Address,
    fee: u32,
    recipient: Address,
    amount_out: U256,
    amount_in_maximum: U256,
) -> Vec<u8> {
    encode_call(
        EXACT_OUTPUT_SINGLE,
        &[single_params(token_in, token_out, fee, recipient, amount_out, amount_in_maximum)],
    )
}

/// Wraps router calls so the router itself enforces `deadline` (unix seconds).
#[must_use]
pub fn encode_multicall(deadline: U256, calls: Vec<Vec<u8>>) -> Vec<u8> {
    encode_call(
        MULTICALL_WITH_DEADLINE,
        &[
            AbiToken::Uint(deadline),
            AbiToken::Array(calls.into_iter().map(AbiToken::Bytes).collect()),
        ],
    )
}

#[must_use]
pub fn encode_approve(spender: Address, amount: U256) -> Vec<u8> {
    encode_call(
        "approve(address,uint256)",
        &[AbiToken::Address(spender), AbiToken::Uint(amount)],
    )
}
