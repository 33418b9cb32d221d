/*
 * One-shot swap against the configured pool
 *
 * usage: swap <sell|buy> <token> <amount> [slippage]
 */

use anyhow::{bail, Context};
use ethers::signers::{LocalWallet, Signer};
use poolhelper::config::Config;
use poolhelper::service::PoolService;
use poolhelper::telemetry;
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (side, token, amount, slippage) = match args.as_slice() {
        [side, token, amount] => (side, token, amount, None),
        [side, token, amount, slippage] => (side, token, amount, Some(slippage)),
        _ => bail!("usage: swap <sell|buy> <token> <amount> [slippage]"),
    };

    let amount = Decimal::from_str(amount).with_context(|| format!("invalid amount {amount:?}"))?;
    let slippage = slippage
        .map(|s| Decimal::from_str(s).with_context(|| format!("invalid slippage {s:?}")))
        .transpose()?;

    let config = Config::load(None)?;
    let wallet: LocalWallet = std::env::var("WALLET_PRIVATE_KEY")
        .context("WALLET_PRIVATE_KEY not set")?
        .parse()
        .context("WALLET_PRIVATE_KEY is not a valid private key")?;
    let wallet = wallet.with_chain_id(config.chain.chain_id);
    let recipient = wallet.address();

    let service = PoolService::new(&config).await?;
    let token = service.resolve_token(token)?;

    let receipt = match side.as_str() {
        "sell" => service.sell(token.address, amount, recipient, &wallet, slippage).await?,
        "buy" => service.buy(token.address, amount, recipient, &wallet, slippage).await?,
        other => bail!("unknown side {other:?}, expected sell or buy"),
    };

    info!(
        tx_hash = ?receipt.tx_hash,
        block_number = receipt.block_number,
        amount_in = %receipt.quote.amount_in,
        token_in = %receipt.quote.token_in.symbol,
        amount_out = %receipt.quote.amount_out,
        token_out = %receipt.quote.token_out.symbol,
        limit = %receipt.limit,
        "Swap confirmed"
    );
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}
