/*
 * RPC client module for reading pool contracts and submitting signed transactions
 */

use async_trait::async_trait;
use ethers::abi::{decode, encode, ParamType, Token as AbiToken};
use ethers::providers::{Http, JsonRpcError, Middleware, Provider, ProviderError, RpcError};
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, BlockId, BlockNumber, Bytes,
    TransactionRequest, H256, U256, U64,
};
use ethers::utils::keccak256;
use std::sync::Arc;
use tracing::{debug, warn};
use crate::execution::SwapChain;
use crate::models::{PoolError, Result, TxStatus};
use crate::quote::GasPriceSource;

/// Selector of the standard `Error(string)` revert payload.
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

pub struct RpcClient {
    provider: Arc<Provider<Http>>,
    chain_id: u64,
}

impl RpcClient {
    pub async fn new(rpc_url: &str, chain_id: u64) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url).map_err(|e| {
            PoolError::ConfigError(format!("Invalid RPC URL {rpc_url}: {e}"))
        })?;

        let chain = provider
            .get_chainid()
            .await
            .map_err(|e| classify("eth_chainId", e))?;

        if chain.as_u64() != chain_id {
            return Err(PoolError::ConfigError(format!(
                "Chain ID mismatch: expected {}, got {}",
                chain_id,
                chain.as_u64()
            )));
        }

        Ok(Self {
            provider: Arc::new(provider),
            chain_id,
        })
    }

    #[must_use]
    pub fn provider(&self) -> Arc<Provider<Http>> {
        self.provider.clone()
    }

    #[must_use]
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub async fn get_gas_price(&self) -> Result<U256> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| classify("eth_gasPrice", e))
    }

    /// Read-only `eth_call`. Execution reverts surface as `ContractError`
    /// (with the decoded reason when there is one); anything else that
    /// stopped the request from reaching a node is `NetworkUnavailable`.
    pub async fn call(&self, to: Address, data: Vec<u8>, block: Option<BlockId>) -> Result<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(Bytes::from(data)).into();
        self.provider
            .call(&tx, block)
            .await
            .map_err(|e| classify("eth_call", e))
    }

    /// `true` when bytecode is deployed at `address`.
    pub async fn has_code(&self, address: Address) -> Result<bool> {
        let code = self
            .provider
            .get_code(address, None)
            .await
            .map_err(|e| classify("eth_getCode", e))?;
        Ok(!code.is_empty())
    }

    pub async fn erc20_balance(&self, token: Address, owner: Address) -> Result<U256> {
        let data = encode_call("balanceOf(address)", &[AbiToken::Address(owner)]);
        let result = self.call(token, data, None).await?;
        decode_uint(&result, "balanceOf")
    }

    pub async fn erc20_allowance(&self, token: Address, owner: Address, spender: Address) -> Result<U256> {
        let data = encode_call(
            "allowance(address,address)",
            &[AbiToken::Address(owner), AbiToken::Address(spender)],
        );
        let result = self.call(token, data, None).await?;
        decode_uint(&result, "allowance")
    }
}

#[async_trait]
impl SwapChain for RpcClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn pending_nonce(&self, owner: Address) -> Result<U256> {
        self.provider
            .get_transaction_count(owner, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| classify("eth_getTransactionCount", e))
    }

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256> {
        self.erc20_balance(token, owner).await
    }

    async fn token_allowance(&self, token: Address, owner: Address, spender: Address) -> Result<U256> {
        self.erc20_allowance(token, owner, spender).await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
        let expected = H256::from(keccak256(&raw));
        match self.provider.send_raw_transaction(raw).await {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(e) => {
                let message = e
                    .as_error_response()
                    .map(|err| err.message.to_lowercase())
                    .unwrap_or_default();
                if message.contains("already known") || message.contains("known transaction") {
                    debug!(tx_hash = ?expected, "Node already holds this transaction");
                    return Ok(expected);
                }
                Err(classify_submission(e))
            }
        }
    }

    async fn transaction_status(&self, tx_hash: H256) -> Result<TxStatus> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| classify("eth_getTransactionReceipt", e))?;

        let Some(receipt) = receipt else {
            return Ok(TxStatus::Pending);
        };
        let Some(block_number) = receipt.block_number else {
            return Ok(TxStatus::Pending);
        };

        if receipt.status.map(|s| s.as_u64()) == Some(1) {
            Ok(TxStatus::Success {
                block_number: block_number.as_u64(),
                gas_used: receipt.gas_used.unwrap_or_default(),
            })
        } else {
            Ok(TxStatus::Reverted {
                block_number: block_number.as_u64(),
            })
        }
    }

    /// Replays a reverted transaction with `eth_call` against the parent block
    /// and decodes its `Error(string)` payload.
    async fn revert_reason(&self, tx_hash: H256) -> Result<Option<String>> {
        let tx = self
            .provider
            .get_transaction(tx_hash)
            .await
            .map_err(|e| classify("eth_getTransactionByHash", e))?;

        let Some(tx) = tx else {
            return Ok(None);
        };
        let Some(block_number) = tx.block_number else {
            return Ok(None);
        };

        let mut replay = TransactionRequest::new()
            .from(tx.from)
            .data(tx.input.clone())
            .value(tx.value)
            .gas(tx.gas);
        if let Some(to) = tx.to {
            replay = replay.to(to);
        }
        let replay: TypedTransaction = replay.into();
        let parent = BlockId::Number(BlockNumber::Number(block_number.saturating_sub(U64::one())));

        match self.provider.call(&replay, Some(parent)).await {
            // state moved on since the original execution
            Ok(_) => Ok(None),
            Err(e) => match e.as_error_response() {
                Some(err) if err.is_revert() => Ok(err
                    .as_revert_data()
                    .and_then(|data| decode_revert_reason(&data))
                    .or_else(|| Some(err.message.clone()))),
                _ => {
                    warn!(tx_hash = ?tx_hash, error = %e, "Revert replay failed");
                    Err(classify("eth_call", e))
                }
            },
        }
    }
}

#[async_trait]
impl GasPriceSource for RpcClient {
    async fn gas_price(&self) -> Result<U256> {
        self.get_gas_price().await
    }
}

/// Maps a provider failure onto the crate taxonomy.
///
/// Only execution reverts are `ContractError`. Any other JSON-RPC error
/// (rate limits, missing headers, internal node faults) says nothing about
/// the contract and is `NetworkUnavailable`, as are transport failures.
pub(crate) fn classify(method: &str, error: ProviderError) -> PoolError {
    match error.as_error_response() {
        Some(err) if err.is_revert() => {
            let reason = err
                .as_revert_data()
                .and_then(|data| decode_revert_reason(&data))
                .unwrap_or_else(|| err.message.clone());
            PoolError::ContractError(format!("{method} reverted: {reason}"))
        }
        Some(err) => PoolError::NetworkUnavailable(format!(
            "{method} failed ({}): {}",
            err.code, err.message
        )),
        None => PoolError::NetworkUnavailable(format!("{method} failed: {error}")),
    }
}

/// Submission errors differ: a node that answers "nonce too low" or
/// "insufficient funds" has rejected the transaction, and resending the same
/// bytes cannot change that. Throttling still counts as unavailability.
fn classify_submission(error: ProviderError) -> PoolError {
    match error.as_error_response() {
        Some(err) if !err.is_revert() && !node_unavailable(err) => PoolError::ContractError(format!(
            "eth_sendRawTransaction rejected: {}",
            err.message
        )),
        _ => classify("eth_sendRawTransaction", error),
    }
}

fn node_unavailable(err: &JsonRpcError) -> bool {
    // -32005 limit exceeded, -32603 internal error, 429 from some gateways
    if matches!(err.code, -32005 | -32603 | 429) {
        return true;
    }
    let message = err.message.to_lowercase();
    ["rate limit", "too many requests", "header not found", "timeout", "timed out", "busy"]
        .iter()
        .any(|hint| message.contains(hint))
}

/// 4-byte selector followed by the ABI-encoded arguments.
#[must_use]
pub fn encode_call(signature: &str, args: &[AbiToken]) -> Vec<u8> {
    let mut data = keccak256(signature.as_bytes())[0..4].to_vec();
    data.extend_from_slice(&encode(args));
    data
}

pub fn decode_uint(data: &[u8], what: &str) -> Result<U256> {
    if data.len() < 32 {
        return Err(PoolError::ContractError(format!(
            "Invalid {what} response: {} bytes",
            data.len()
        )));
    }
    Ok(U256::from_big_endian(&data[0..32]))
}

/// Decodes an `Error(string)` revert payload.
#[must_use]
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    if data.len() < 4 || data[0..4] != ERROR_STRING_SELECTOR {
        return None;
    }
    match decode(&[ParamType::String], &data[4..]).ok()?.into_iter().next()? {
        AbiToken::String(reason) => Some(reason),
        _ => None,
    }
}
