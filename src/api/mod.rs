/*
 * REST API: pool price, quotes and Prometheus metrics
 */

use rocket::http::{ContentType, Status};
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use rocket::{get, routes, State};
use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::error;
use crate::models::{PoolError, Quote};
use crate::service::PoolService;

pub struct ApiState {
    pub service: Arc<PoolService>,
}

type ApiResult<T> = std::result::Result<T, Custom<String>>;

#[derive(Debug, Serialize)]
pub struct PriceResponse {
    pub pool: String,
    /// Token the price is denominated in.
    pub quote_token: String,
    /// Token being priced.
    pub base_token: String,
    pub price: Decimal,
}

fn status_for(err: &PoolError) -> Status {
    match err {
        PoolError::InvalidAmount(_)
        | PoolError::UnknownToken(_)
        | PoolError::TokenNotInPool { .. }
        | PoolError::InsufficientLiquidity(_) => Status::BadRequest,
        PoolError::NetworkUnavailable(_) => Status::ServiceUnavailable,
        _ => Status::InternalServerError,
    }
}

fn reject(err: PoolError) -> Custom<String> {
    let status = status_for(&err);
    if status.code >= 500 {
        error!(error = %err, "Request failed");
    }
    Custom(status, err.to_string())
}

fn parse_amount(amount: &str) -> ApiResult<Decimal> {
    Decimal::from_str(amount)
        .map_err(|e| Custom(Status::BadRequest, format!("Invalid amount {amount:?}: {e}")))
}

#[get("/health")]
pub async fn health_check() -> &'static str {
    "OK"
}

/// token1 per token0, or token0 per token1 with `reverse=true`.
#[get("/api/v1/price?<reverse>")]
pub async fn get_price(reverse: Option<bool>, state: &State<ApiState>) -> ApiResult<Json<PriceResponse>> {
    let reverse = reverse.unwrap_or(false);
    let price = state.service.current_price(reverse).await.map_err(reject)?;

    let pool = state.service.pool();
    let (base, quote) = if reverse {
        (&pool.token1, &pool.token0)
    } else {
        (&pool.token0, &pool.token1)
    };

    Ok(Json(PriceResponse {
        pool: format!("{:?}", pool.address),
        quote_token: quote.symbol.clone(),
        base_token: base.symbol.clone(),
        price,
    }))
}

#[get("/api/v1/quote/sell?<token>&<amount>")]
pub async fn quote_sell(token: &str, amount: &str, state: &State<ApiState>) -> ApiResult<Json<Quote>> {
    let token_in = state.service.resolve_token(token).map_err(reject)?;
    let amount_in = parse_amount(amount)?;
    let quote = state
        .service
        .quote_sell(token_in.address, amount_in)
        .await
        .map_err(reject)?;
    Ok(Json(quote))
}

#[get("/api/v1/quote/buy?<token>&<amount>")]
pub async fn quote_buy(token: &str, amount: &str, state: &State<ApiState>) -> ApiResult<Json<Quote>> {
    let token_out = state.service.resolve_token(token).map_err(reject)?;
    let amount_out = parse_amount(amount)?;
    let quote = state
        .service
        .quote_buy(token_out.address, amount_out)
        .await
        .map_err(reject)?;
    Ok(Json(quote))
}

#[get("/metrics")]
pub async fn metrics(state: &State<ApiState>) -> ApiResult<(ContentType, String)> {
    let body = state.service.metrics().render().map_err(reject)?;
    Ok((ContentType::Plain, body))
}

#[must_use]
pub fn create_rocket(state: ApiState) -> rocket::Rocket<rocket::Build> {
    rocket::build()
        .manage(state)
        .mount("/", routes![health_check, get_price, quote_sell, quote_buy, metrics])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::service_with;
    use crate::testing::{FakeChain, RecordingOracle};
    use ethers::types::U256;
    use rocket::local::asynchronous::Client;
    use serde_json::Value;

    async fn client() -> Client {
        let chain = Arc::new(FakeChain::funded(U256::zero(), U256::zero()));
        let oracle = RecordingOracle::returning(U256::from(33_631_070_000_000_000u64));
        let service = Arc::new(service_with(oracle, chain).await);
        Client::tracked(create_rocket(ApiState { service }))
            .await
            .unwrap()
    }

    #[rocket::async_test]
    async fn health_is_ok() {
        let client = client().await;
        let response = client.get("/health").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.into_string().await.unwrap(), "OK");
    }

    #[rocket::async_test]
    async fn price_names_both_tokens() {
        let client = client().await;
        let response = client.get("/api/v1/price?reverse=true").dispatch().await;
        assert_eq!(response.status(), Status::Ok);

        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(body["base_token"], "WETH");
        assert_eq!(body["quote_token"], "USDC");
        assert!(body["price"].as_str().unwrap().starts_with("29411.76470588"));
    }

    #[rocket::async_test]
    async fn sell_quote_by_symbol() {
        let client = client().await;
        let response = client
            .get("/api/v1/quote/sell?token=USDC&amount=1000")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);

        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        assert_eq!(body["side"], "SELL");
        assert_eq!(body["amount_out"], "0.03363107");
        assert_eq!(body["token_out"]["symbol"], "WETH");
    }

    #[rocket::async_test]
    async fn bad_requests_are_400() {
        let client = client().await;
        for uri in [
            "/api/v1/quote/sell?token=DAI&amount=1",
            "/api/v1/quote/sell?token=USDC&amount=lots",
            "/api/v1/quote/buy?token=WETH&amount=-1",
        ] {
            let response = client.get(uri).dispatch().await;
            assert_eq!(response.status(), Status::BadRequest, "{uri}");
        }
    }

    #[rocket::async_test]
    async fn metrics_are_exposed_as_text() {
        let client = client().await;
        client
            .get("/api/v1/quote/sell?token=USDC&amount=1000")
            .dispatch()
            .await;

        let response = client.get("/metrics").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let body = response.into_string().await.unwrap();
        assert!(body.contains("poolhelper_quotes_total{side=\"sell\"} 1"));
    }
}
