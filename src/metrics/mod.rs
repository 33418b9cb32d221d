/*
 * Prometheus counters for quotes, swaps and trade-history ingestion
 */

use num_traits::ToPrimitive;
use prometheus::{Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use rust_decimal::Decimal;
use crate::models::{Result, SwapSide};

pub struct Metrics {
    registry: Registry,
    quotes: IntCounterVec,
    quote_errors: IntCounterVec,
    swaps: IntCounterVec,
    pool_price: Gauge,
    ingest_pages: IntCounter,
    ingest_records: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let quotes = IntCounterVec::new(
            Opts::new("poolhelper_quotes_total", "Quotes computed"),
            &["side"],
        )?;
        let quote_errors = IntCounterVec::new(
            Opts::new("poolhelper_quote_errors_total", "Quote requests that failed"),
            &["side"],
        )?;
        let swaps = IntCounterVec::new(
            Opts::new("poolhelper_swaps_total", "Swaps by terminal outcome"),
            &["side", "outcome"],
        )?;
        let pool_price = Gauge::new(
            "poolhelper_pool_price",
            "Last observed pool price, token1 per token0",
        )?;
        let ingest_pages = IntCounter::new("poolhelper_ingest_pages_total", "Trade-history pages fetched")?;
        let ingest_records = IntCounter::new(
            "poolhelper_ingest_records_total",
            "Trade-history records accepted",
        )?;

        registry.register(Box::new(quotes.clone()))?;
        registry.register(Box::new(quote_errors.clone()))?;
        registry.register(Box::new(swaps.clone()))?;
        registry.register(Box::new(pool_price.clone()))?;
        registry.register(Box::new(ingest_pages.clone()))?;
        registry.register(Box::new(ingest_records.clone()))?;

        Ok(Self {
            registry,
            quotes,
            quote_errors,
            swaps,
            pool_price,
            ingest_pages,
            ingest_records,
        })
    }

    pub fn quote_ok(&self, side: SwapSide) {
        self.quotes.with_label_values(&[side.as_str()]).inc();
    }

    pub fn quote_failed(&self, side: SwapSide) {
        self.quote_errors.with_label_values(&[side.as_str()]).inc();
    }

    /// `outcome` is the terminal swap stage: confirmed, reverted, timed_out or rejected.
    pub fn swap_finished(&self, side: SwapSide, outcome: &str) {
        self.swaps.with_label_values(&[side.as_str(), outcome]).inc();
    }

    /// Gauges are floats; precision loss is acceptable for display only.
    pub fn observe_price(&self, price: Decimal) {
        if let Some(value) = price.to_f64() {
            self.pool_price.set(value);
        }
    }

    pub fn ingest_page(&self, records: usize) {
        self.ingest_pages.inc();
        self.ingest_records.inc_by(records as u64);
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}
