//! USD price resolution for aggregated wallet holdings.
//!
//! [`PriceService::resolve_prices`] runs a layered cascade over every token
//! of a merged wallet: existing prices, peer inference, the shared price
//! cache, an external quote API and finally local heuristics. Failures in
//! any layer leave tokens unpriced instead of failing the aggregation.

pub mod cache;
pub mod cascade;
pub mod coinmarketcap;

pub use cache::{InMemoryPriceCache, PriceCache, RedisPriceCache};
pub use cascade::{strip_wrapper_prefix, PriceResolutionReport, PriceService, PriceSource};
pub use coinmarketcap::{CoinMarketCapClient, QuoteProvider};

use persistence_layer::PersistenceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PriceError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Quote API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Invalid price data: {0}")]
    InvalidPriceData(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PriceError>;
