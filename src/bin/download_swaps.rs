/*
 * Exports a pool's historical swaps from the subgraph to CSV
 */

use poolhelper::config::Config;
use poolhelper::ingest::{export_swaps, HistoricalSwapIngester, SubgraphClient};
use poolhelper::metrics::Metrics;
use poolhelper::telemetry;
use poolhelper::PoolError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    // optional: path to a TOML config file
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let pool_id = config.ingest_pool_id()?;
    let subgraph = SubgraphClient::new(
        config.subgraph.url.clone(),
        config.subgraph.api_key.clone(),
        Duration::from_secs(config.subgraph.timeout_secs),
    )?;
    let metrics = Arc::new(Metrics::new()?);
    let ingester = HistoricalSwapIngester::new(
        Arc::new(subgraph),
        config.subgraph.page_size,
        Duration::from_millis(config.subgraph.request_delay_ms),
    )
    .with_metrics(metrics);

    info!(
        pool_id = %pool_id,
        output = %config.ingest.output.display(),
        resume = config.ingest.resume,
        "Exporting swaps"
    );

    match export_swaps(
        &ingester,
        &pool_id,
        config.ingest.timestamp_gte,
        config.ingest.timestamp_lte,
        &config.ingest.output,
        config.ingest.resume,
    )
    .await
    {
        Ok(summary) => {
            info!(
                records = summary.records,
                resumed_from = ?summary.resumed_from,
                "Export finished"
            );
            Ok(())
        }
        Err(e @ PoolError::IngestInterrupted { .. }) => {
            error!(
                error = %e,
                "Export interrupted; rerun with ingest.resume = true to continue"
            );
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
