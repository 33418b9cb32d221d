/*
 * poolhelper - Uniswap V3 pool toolkit
 * Core library exports and module declarations
 */

pub mod api;
pub mod config;
pub mod execution;
pub mod ingest;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod price;
pub mod quote;
pub mod rpc;
pub mod service;
pub mod telemetry;
pub mod utils;

#[cfg(test)]
mod testing;

pub use self::config::Config;
pub use models::*;
pub use service::PoolService;
