/*
 * poolhelper - Uniswap V3 pool service
 * Main entry point for the REST API
 */

use poolhelper::{api, config::Config, service::PoolService, telemetry};
use std::sync::Arc;
use tracing::{error, info};

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing();

    info!("Starting poolhelper");

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(pool = ?config.chain.pool_address, "Configuration loaded");

    let service = Arc::new(PoolService::new(&config).await?);

    let figment = rocket::Config::figment()
        .merge(("address", config.server.host.clone()))
        .merge(("port", config.server.port));

    info!("Starting API server on {}:{}", config.server.host, config.server.port);

    api::create_rocket(api::ApiState { service })
        .configure(figment)
        .launch()
        .await?;

    Ok(())
}
