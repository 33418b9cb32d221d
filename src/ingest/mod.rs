/*
 * Historical swap ingestion: paginated, resumable trade-log export
 */

pub mod subgraph;

use async_trait::async_trait;
use ethers::types::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use crate::metrics::Metrics;
use crate::models::{PoolError, Result};

pub use subgraph::SubgraphClient;

/// One swap event of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub id: String,
    pub timestamp: u64,
    #[serde(with = "u256_dec")]
    pub sqrt_price_x96: U256,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount0: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount1: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_usd: Decimal,
    pub tick: i32,
}

mod u256_dec {
    use ethers::types::U256;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_dec_str(&s).map_err(D::Error::custom)
    }
}

/// One page request: `(pool, bounds, skip, first)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapPageQuery {
    pub pool_id: String,
    pub timestamp_gte: Option<u64>,
    pub timestamp_lte: Option<u64>,
    pub skip: usize,
    pub first: usize,
}

/// A time-range query service that pages by numeric offset, ascending by timestamp.
#[async_trait]
pub trait SwapQueryService: Send + Sync {
    async fn fetch_swaps(&self, query: &SwapPageQuery) -> Result<Vec<SwapRecord>>;
}

/// Resumability state of one ingestion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestCheckpoint {
    pub pool_id: String,
    pub timestamp_gte: Option<u64>,
    pub timestamp_lte: Option<u64>,
    /// Records consumed from the service so far, duplicates included.
    pub offset: usize,
    pub page_size: usize,
    pub records: Vec<SwapRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointMeta {
    pool_id: String,
    timestamp_gte: Option<u64>,
    timestamp_lte: Option<u64>,
    offset: usize,
    page_size: usize,
    records: usize,
}

impl IngestCheckpoint {
    #[must_use]
    pub fn new(
        pool_id: impl Into<String>,
        timestamp_gte: Option<u64>,
        timestamp_lte: Option<u64>,
        page_size: usize,
    ) -> Self {
        Self {
            pool_id: pool_id.into(),
            timestamp_gte,
            timestamp_lte,
            offset: 0,
            page_size,
            records: Vec::new(),
        }
    }

    /// `<path>.checkpoint.json`
    #[must_use]
    pub fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".checkpoint.json");
        PathBuf::from(name)
    }

    /// Writes the record table to `path` and the progress to its sidecar.
    pub fn persist(&self, path: &Path) -> Result<()> {
        write_records(path, &self.records)?;

        let meta = CheckpointMeta {
            pool_id: self.pool_id.clone(),
            timestamp_gte: self.timestamp_gte,
            timestamp_lte: self.timestamp_lte,
            offset: self.offset,
            page_size: self.page_size,
            records: self.records.len(),
        };
        write_atomically(&Self::sidecar_path(path), serde_json::to_vec_pretty(&meta)?.as_slice())?;

        info!(
            pool_id = %self.pool_id,
            offset = self.offset,
            records = self.records.len(),
            path = %path.display(),
            "Checkpoint persisted"
        );
        Ok(())
    }

    /// The checkpoint persisted at `path`, if there is one.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let sidecar = Self::sidecar_path(path);
        if !sidecar.exists() {
            return Ok(None);
        }

        let meta: CheckpointMeta = serde_json::from_slice(&fs::read(&sidecar)?)?;
        let records = read_records(path)?;
        if records.len() != meta.records {
            return Err(PoolError::ConfigError(format!(
                "Checkpoint {} lists {} records but {} holds {}",
                sidecar.display(),
                meta.records,
                path.display(),
                records.len()
            )));
        }

        Ok(Some(Self {
            pool_id: meta.pool_id,
            timestamp_gte: meta.timestamp_gte,
            timestamp_lte: meta.timestamp_lte,
            offset: meta.offset,
            page_size: meta.page_size,
            records,
        }))
    }

    /// Removes the sidecar; the record table stays.
    pub fn discard(path: &Path) -> Result<()> {
        let sidecar = Self::sidecar_path(path);
        if sidecar.exists() {
            fs::remove_file(sidecar)?;
        }
        Ok(())
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Column order of the exported table, matching `SwapRecord`.
pub const SWAP_COLUMNS: [&str; 7] = [
    "id",
    "timestamp",
    "sqrt_price_x96",
    "amount0",
    "amount1",
    "amount_usd",
    "tick",
];

/// Writes the flat record table as CSV with a header row, even when empty.
pub fn write_records(path: &Path, records: &[SwapRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if records.is_empty() {
        writer.write_record(SWAP_COLUMNS)?;
    }
    for record in records {
        writer.serialize(record)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| PoolError::Io(e.into_error()))?;
    write_atomically(path, &bytes)
}

pub fn read_records(path: &Path) -> Result<Vec<SwapRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    reader
        .deserialize()
        .map(|row| row.map_err(PoolError::from))
        .collect()
}

pub struct HistoricalSwapIngester {
    service: Arc<dyn SwapQueryService>,
    page_size: usize,
    request_delay: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl HistoricalSwapIngester {
    #[must_use]
    pub fn new(service: Arc<dyn SwapQueryService>, page_size: usize, request_delay: Duration) -> Self {
        Self {
            service,
            page_size,
            request_delay,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Every swap of `pool_id` within the bounds, ascending by timestamp.
    ///
    /// On failure the error is `IngestInterrupted` carrying everything fetched so far.
    pub async fn download_all_swaps(
        &self,
        pool_id: &str,
        timestamp_gte: Option<u64>,
        timestamp_lte: Option<u64>,
    ) -> Result<Vec<SwapRecord>> {
        let checkpoint = IngestCheckpoint::new(pool_id, timestamp_gte, timestamp_lte, self.page_size);
        self.resume(checkpoint).await
    }

    /// Continues from `checkpoint.offset`, keeping the records it already holds.
    pub async fn resume(&self, mut checkpoint: IngestCheckpoint) -> Result<Vec<SwapRecord>> {
        if self.page_size == 0 {
            return Err(PoolError::ConfigError("Swap page size must be positive".into()));
        }
        // the offset only means something for the page size it was taken with
        checkpoint.page_size = self.page_size;
        let mut seen: HashSet<String> = checkpoint.records.iter().map(|r| r.id.clone()).collect();

        info!(
            pool_id = %checkpoint.pool_id,
            offset = checkpoint.offset,
            timestamp_gte = ?checkpoint.timestamp_gte,
            timestamp_lte = ?checkpoint.timestamp_lte,
            "Downloading swaps"
        );

        let mut first_request = true;
        loop {
            if !first_request {
                sleep(self.request_delay).await;
            }
            first_request = false;

            let query = SwapPageQuery {
                pool_id: checkpoint.pool_id.clone(),
                timestamp_gte: checkpoint.timestamp_gte,
                timestamp_lte: checkpoint.timestamp_lte,
                skip: checkpoint.offset,
                first: self.page_size,
            };

            let page = match self.service.fetch_swaps(&query).await {
                Ok(page) => page,
                Err(source) => {
                    error!(
                        pool_id = %checkpoint.pool_id,
                        offset = checkpoint.offset,
                        records = checkpoint.records.len(),
                        error = %source,
                        "Swap download interrupted"
                    );
                    return Err(PoolError::IngestInterrupted {
                        checkpoint: Box::new(checkpoint),
                        source: Box::new(source),
                    });
                }
            };

            let fetched = page.len();
            let accepted = Self::append_page(&mut checkpoint, &mut seen, page);
            checkpoint.offset += fetched;

            if let Some(metrics) = &self.metrics {
                metrics.ingest_page(accepted);
            }
            info!(
                pool_id = %checkpoint.pool_id,
                fetched,
                accepted,
                total = checkpoint.records.len(),
                offset = checkpoint.offset,
                "Fetched swap page"
            );

            if fetched == 0 || fetched < self.page_size {
                // a short page is taken as the end of the range; the service is
                // never asked to confirm that no later records exist
                debug!(fetched, page_size = self.page_size, "Short page, assuming end of range");
                break;
            }
        }

        info!(
            pool_id = %checkpoint.pool_id,
            records = checkpoint.records.len(),
            "Swap download complete"
        );
        Ok(checkpoint.records)
    }

    fn append_page(checkpoint: &mut IngestCheckpoint, seen: &mut HashSet<String>, page: Vec<SwapRecord>) -> usize {
        let mut accepted = 0;
        for record in page {
            if !seen.insert(record.id.clone()) {
                debug!(id = %record.id, "Dropping duplicate swap");
                continue;
            }
            if let Some(last) = checkpoint.records.last() {
                if record.timestamp < last.timestamp {
                    warn!(
                        id = %record.id,
                        timestamp = record.timestamp,
                        previous = last.timestamp,
                        "Swap out of timestamp order"
                    );
                }
            }
            checkpoint.records.push(record);
            accepted += 1;
        }
        accepted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub records: usize,
    /// Offset the run resumed from, when it continued a checkpoint.
    pub resumed_from: Option<usize>,
}

/// Downloads the pool's swaps into `output` as CSV.
///
/// An interrupted run persists its checkpoint next to `output` before the
/// error is returned. With `resume` set, a matching checkpoint found there is
/// continued instead of starting over.
pub async fn export_swaps(
    ingester: &HistoricalSwapIngester,
    pool_id: &str,
    timestamp_gte: Option<u64>,
    timestamp_lte: Option<u64>,
    output: &Path,
    resume: bool,
) -> Result<ExportSummary> {
    let existing = if resume {
        IngestCheckpoint::load(output)?
    } else {
        None
    };

    let (result, resumed_from) = match existing {
        Some(checkpoint) => {
            if checkpoint.pool_id != pool_id
                || checkpoint.timestamp_gte != timestamp_gte
                || checkpoint.timestamp_lte != timestamp_lte
            {
                return Err(PoolError::ConfigError(format!(
                    "Checkpoint at {} is for pool {} {:?}..{:?}, not {} {:?}..{:?}",
                    output.display(),
                    checkpoint.pool_id,
                    checkpoint.timestamp_gte,
                    checkpoint.timestamp_lte,
                    pool_id,
                    timestamp_gte,
                    timestamp_lte
                )));
            }
            let offset = checkpoint.offset;
            info!(offset, records = checkpoint.records.len(), "Resuming from checkpoint");
            (ingester.resume(checkpoint).await, Some(offset))
        }
        None => (
            ingester
                .download_all_swaps(pool_id, timestamp_gte, timestamp_lte)
                .await,
            None,
        ),
    };

    match result {
        Ok(records) => {
            write_records(output, &records)?;
            IngestCheckpoint::discard(output)?;
            info!(records = records.len(), path = %output.display(), "Swaps exported");
            Ok(ExportSummary {
                records: records.len(),
                resumed_from,
            })
        }
        Err(PoolError::IngestInterrupted { checkpoint, source }) => {
            // the checkpoint still travels with the error when the flush fails
            if let Err(flush) = checkpoint.persist(output) {
                error!(
                    path = %output.display(),
                    records = checkpoint.records.len(),
                    offset = checkpoint.offset,
                    error = %flush,
                    "Could not persist checkpoint"
                );
            }
            Err(PoolError::IngestInterrupted { checkpoint, source })
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{swap_records, FakeSwapService};
    use tempfile::tempdir;

    fn ingester(service: Arc<FakeSwapService>, page_size: usize) -> HistoricalSwapIngester {
        HistoricalSwapIngester::new(service, page_size, Duration::from_millis(250))
    }

    #[tokio::test(start_paused = true)]
    async fn issues_ceil_n_plus_one_over_p_requests() {
        for (n, p) in [(0, 10), (9, 10), (10, 10), (11, 10), (25, 5), (1, 1000)] {
            let service = Arc::new(FakeSwapService::new(swap_records(n)));
            let records = ingester(service.clone(), p)
                .download_all_swaps("0xpool", None, None)
                .await
                .unwrap();

            assert_eq!(records.len(), n);
            assert_eq!(service.requests().len(), (n + 1).div_ceil(p), "n={n} p={p}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pages_advance_by_offset_with_bounds() {
        let service = Arc::new(FakeSwapService::new(swap_records(7)));
        ingester(service.clone(), 3)
            .download_all_swaps("0xpool", Some(1_000), Some(9_000))
            .await
            .unwrap();

        let skips: Vec<usize> = service.requests().iter().map(|q| q.skip).collect();
        assert_eq!(skips, vec![0, 3, 6]);
        assert!(service
            .requests()
            .iter()
            .all(|q| q.first == 3 && q.timestamp_gte == Some(1_000) && q.timestamp_lte == Some(9_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_requests() {
        let service = Arc::new(FakeSwapService::new(swap_records(20)));
        let started = tokio::time::Instant::now();
        ingester(service.clone(), 10)
            .download_all_swaps("0xpool", None, None)
            .await
            .unwrap();
        // three requests, two gaps
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_carries_partial_records_and_offset() {
        let service = Arc::new(FakeSwapService::new(swap_records(25)).failing_at_request(2));
        let err = ingester(service, 10)
            .download_all_swaps("0xpool", None, None)
            .await
            .unwrap_err();

        match err {
            PoolError::IngestInterrupted { checkpoint, source } => {
                assert_eq!(checkpoint.offset, 20);
                assert_eq!(checkpoint.records, swap_records(20));
                assert!(source.is_transient());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_run_matches_uninterrupted_run() {
        let dataset = swap_records(37);
        let uninterrupted = ingester(Arc::new(FakeSwapService::new(dataset.clone())), 10)
            .download_all_swaps("0xpool", Some(0), Some(u64::MAX))
            .await
            .unwrap();

        let flaky = Arc::new(FakeSwapService::new(dataset.clone()).failing_at_request(3));
        let checkpoint = match ingester(flaky, 10)
            .download_all_swaps("0xpool", Some(0), Some(u64::MAX))
            .await
        {
            Err(PoolError::IngestInterrupted { checkpoint, .. }) => *checkpoint,
            other => panic!("expected interruption, got {other:?}"),
        };
        assert_eq!(checkpoint.offset, 30);

        let healthy = Arc::new(FakeSwapService::new(dataset));
        let resumed = ingester(healthy.clone(), 10).resume(checkpoint).await.unwrap();

        assert_eq!(resumed, uninterrupted);
        assert_eq!(healthy.requests()[0].skip, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_ids_are_dropped_without_moving_the_offset() {
        let mut dataset = swap_records(4);
        dataset.insert(2, dataset[1].clone());
        let service = Arc::new(FakeSwapService::new(dataset));

        let records = ingester(service.clone(), 2)
            .download_all_swaps("0xpool", None, None)
            .await
            .unwrap();

        assert_eq!(records, swap_records(4));
        // 5 raw records at page size 2: skips 0, 2, 4
        let skips: Vec<usize> = service.requests().iter().map(|q| q.skip).collect();
        assert_eq!(skips, vec![0, 2, 4]);
    }

    #[test]
    fn checkpoint_persists_and_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("swaps.csv");

        let mut checkpoint = IngestCheckpoint::new("0xpool", Some(1), None, 1000);
        checkpoint.records = swap_records(3);
        checkpoint.offset = 3;
        checkpoint.persist(&path).unwrap();

        assert!(IngestCheckpoint::sidecar_path(&path).exists());
        let loaded = IngestCheckpoint::load(&path).unwrap().unwrap();
        assert_eq!(loaded, checkpoint);

        IngestCheckpoint::discard(&path).unwrap();
        assert!(IngestCheckpoint::load(&path).unwrap().is_none());
        assert_eq!(read_records(&path).unwrap(), swap_records(3));
    }

    #[test]
    fn csv_keeps_full_precision() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("swaps.csv");
        let records = swap_records(2);
        write_records(&path, &records).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("id,timestamp,sqrt_price_x96,amount0,amount1,amount_usd,tick"));
        assert_eq!(read_records(&path).unwrap(), records);
    }

    #[tokio::test(start_paused = true)]
    async fn export_flushes_on_failure_and_resumes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("swaps.csv");
        let dataset = swap_records(23);

        let flaky = Arc::new(FakeSwapService::new(dataset.clone()).failing_at_request(1));
        let err = export_swaps(&ingester(flaky, 10), "0xpool", None, None, &path, true)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::IngestInterrupted { .. }));
        assert_eq!(read_records(&path).unwrap(), swap_records(10));

        let healthy = Arc::new(FakeSwapService::new(dataset.clone()));
        let summary = export_swaps(&ingester(healthy.clone(), 10), "0xpool", None, None, &path, true)
            .await
            .unwrap();

        assert_eq!(summary, ExportSummary { records: 23, resumed_from: Some(10) });
        assert_eq!(read_records(&path).unwrap(), dataset);
        assert!(!IngestCheckpoint::sidecar_path(&path).exists());
        assert_eq!(healthy.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_page_size_is_refused() {
        let service = Arc::new(FakeSwapService::new(swap_records(3)));
        let err = ingester(service.clone(), 0)
            .download_all_swaps("0xpool", None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::ConfigError(_)));
        assert!(service.requests().is_empty());
    }

    #[test]
    fn empty_table_still_has_a_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        write_records(&path, &[]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim_end(), SWAP_COLUMNS.join(","));
        assert!(read_records(&path).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_keeps_the_interruption_and_its_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("swaps.csv");

        let flaky = Arc::new(FakeSwapService::new(swap_records(23)).failing_at_request(1));
        let err = export_swaps(&ingester(flaky, 10), "0xpool", None, None, &path, false)
            .await
            .unwrap_err();

        match err {
            PoolError::IngestInterrupted { checkpoint, source } => {
                assert_eq!(checkpoint.offset, 10);
                assert_eq!(checkpoint.records, swap_records(10));
                assert!(source.is_transient());
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn export_refuses_a_checkpoint_for_another_pool() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("swaps.csv");
        IngestCheckpoint::new("0xother", None, None, 10).persist(&path).unwrap();

        let service = Arc::new(FakeSwapService::new(swap_records(3)));
        let err = export_swaps(&ingester(service.clone(), 10), "0xpool", None, None, &path, true)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::ConfigError(_)));
        assert!(service.requests().is_empty());
    }
}
