/*
 * Uniswap V3 subgraph client (GraphQL over HTTPS)
 */

use async_trait::async_trait;
use ethers::types::U256;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use crate::models::{PoolError, Result};
use super::{SwapPageQuery, SwapQueryService, SwapRecord};

pub struct SubgraphClient {
    client: Client,
    url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<SwapsData>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SwapsData {
    swaps: Vec<RawSwap>,
}

/// Subgraph numbers arrive as JSON strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSwap {
    id: String,
    timestamp: String,
    sqrt_price_x96: String,
    amount0: String,
    amount1: String,
    #[serde(rename = "amountUSD")]
    amount_usd: String,
    tick: String,
}

impl TryFrom<RawSwap> for SwapRecord {
    type Error = PoolError;

    fn try_from(raw: RawSwap) -> Result<Self> {
        let bad = |field: &str, value: &str| {
            PoolError::QueryService(format!("Swap {} has invalid {field}: {value:?}", raw.id))
        };

        Ok(SwapRecord {
            timestamp: raw.timestamp.parse().map_err(|_| bad("timestamp", &raw.timestamp))?,
            sqrt_price_x96: U256::from_dec_str(&raw.sqrt_price_x96)
                .map_err(|_| bad("sqrtPriceX96", &raw.sqrt_price_x96))?,
            amount0: Decimal::from_str(&raw.amount0).map_err(|_| bad("amount0", &raw.amount0))?,
            amount1: Decimal::from_str(&raw.amount1).map_err(|_| bad("amount1", &raw.amount1))?,
            amount_usd: Decimal::from_str(&raw.amount_usd).map_err(|_| bad("amountUSD", &raw.amount_usd))?,
            tick: raw.tick.parse().map_err(|_| bad("tick", &raw.tick))?,
            id: raw.id,
        })
    }
}

impl SubgraphClient {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PoolError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }
}

/// GraphQL document and variables for one page. Only the bounds that are set
/// appear in the `where` filter.
#[must_use]
pub fn build_request(query: &SwapPageQuery) -> Value {
    let mut params = vec!["$pool: String!", "$first: Int!", "$skip: Int!"];
    let mut filters = vec!["pool: $pool"];
    let mut variables = Map::new();
    variables.insert("pool".into(), json!(query.pool_id.to_lowercase()));
    variables.insert("first".into(), json!(query.first));
    variables.insert("skip".into(), json!(query.skip));

    if let Some(gte) = query.timestamp_gte {
        params.push("$gte: BigInt!");
        filters.push("timestamp_gte: $gte");
        variables.insert("gte".into(), json!(gte.to_string()));
    }
    if let Some(lte) = query.timestamp_lte {
        params.push("$lte: BigInt!");
        filters.push("timestamp_lte: $lte");
        variables.insert("lte".into(), json!(lte.to_string()));
    }

    let document = format!(
        "query Swaps({}) {{ swaps(first: $first, skip: $skip, orderBy: timestamp, orderDirection: asc, \
         where: {{ {} }}) {{ id timestamp sqrtPriceX96 amount0 amount1 amountUSD tick }} }}",
        params.join(", "),
        filters.join(", ")
    );

    json!({ "query": document, "variables": Value::Object(variables) })
}

#[async_trait]
impl SwapQueryService for SubgraphClient {
    async fn fetch_swaps(&self, query: &SwapPageQuery) -> Result<Vec<SwapRecord>> {
        let mut request = self.client.post(&self.url).json(&build_request(query));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(PoolError::NetworkUnavailable(format!(
                "Subgraph returned HTTP {status}"
            )));
        }
        if !status.is_success() {
            return Err(PoolError::QueryService(format!("Subgraph returned HTTP {status}")));
        }

        let body: GraphQlResponse = response
            .json()
            .await
            .map_err(|e| PoolError::QueryService(format!("Invalid subgraph response: {e}")))?;

        if let Some(errors) = body.errors.filter(|e| !e.is_empty()) {
            let messages: Vec<String> = errors.into_iter().map(|e| e.message).collect();
            return Err(PoolError::QueryService(messages.join("; ")));
        }

        let swaps = body
            .data
            .ok_or_else(|| PoolError::QueryService("Subgraph response has no data".to_string()))?
            .swaps;
        debug!(skip = query.skip, returned = swaps.len(), "Subgraph page");

        swaps.into_iter().map(SwapRecord::try_from).collect()
    }
}
