use async_trait::async_trait;
use config_manager::CoinMarketCapConfig;
use reqwest::{Client, StatusCode};
use retry_utils::{retry_async, ErrorClass, RetryPolicy};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{PriceError, Result};

/// External USD quote source, queried by symbol
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    /// Quote as many of `symbols` as possible. Keys of the returned map are
    /// lowercase symbols; unknown symbols are omitted.
    async fn quote(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>>;
}

#[derive(Debug, Deserialize)]
struct QuotesResponse {
    status: ApiStatus,
    #[serde(default)]
    data: HashMap<String, Vec<CmcAsset>>,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    error_code: i64,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CmcAsset {
    symbol: String,
    #[serde(default)]
    quote: HashMap<String, CmcQuote>,
}

#[derive(Debug, Deserialize)]
struct CmcQuote {
    price: Option<f64>,
}

#[derive(Clone)]
pub struct CoinMarketCapClient {
    config: CoinMarketCapConfig,
    http_client: Client,
    retry_policy: RetryPolicy,
}

impl CoinMarketCapClient {
    pub fn new(config: CoinMarketCapConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(PriceError::Config("CoinMarketCap API key is empty".to_string()));
        }
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self {
            config,
            http_client,
            retry_policy: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    async fn fetch_batch(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>> {
        let url = format!(
            "{}/v2/cryptocurrency/quotes/latest",
            self.config.api_base_url.trim_end_matches('/')
        );
        let symbol_param = symbols
            .iter()
            .map(|s| s.to_uppercase())
            .collect::<Vec<_>>()
            .join(",");

        debug!("Fetching CoinMarketCap quotes for {}", symbol_param);

        let response = self
            .http_client
            .get(&url)
            .header("X-CMC_PRO_API_KEY", &self.config.api_key)
            .header("Accept", "application/json")
            .query(&[
                ("symbol", symbol_param.as_str()),
                ("convert", "USD"),
                ("skip_invalid", "true"),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PriceError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PriceError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: QuotesResponse = response.json().await?;
        parse_quotes(body)
    }
}

fn parse_quotes(body: QuotesResponse) -> Result<HashMap<String, Decimal>> {
    if body.status.error_code != 0 {
        return Err(PriceError::Api {
            status: 200,
            message: body
                .status
                .error_message
                .unwrap_or_else(|| format!("error code {}", body.status.error_code)),
        });
    }

    let mut prices = HashMap::new();
    for (symbol, assets) in body.data {
        // Several assets can share a ticker; the API lists them by rank
        let price = assets.iter().find_map(|asset| {
            let usd = asset.quote.get("USD")?.price?;
            match Decimal::try_from(usd) {
                Ok(price) if price > Decimal::ZERO => Some(price),
                Ok(_) => None,
                Err(e) => {
                    warn!("Unrepresentable quote for {}: {}", asset.symbol, e);
                    None
                }
            }
        });
        if let Some(price) = price {
            prices.insert(symbol.to_lowercase(), price);
        }
    }
    Ok(prices)
}

fn classify(error: &PriceError) -> ErrorClass {
    match error {
        PriceError::RateLimited => ErrorClass::RateLimited,
        PriceError::Http(e) if e.is_timeout() || e.is_connect() => ErrorClass::Transient,
        PriceError::Api { status, .. } if *status >= 500 => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

#[async_trait]
impl QuoteProvider for CoinMarketCapClient {
    async fn quote(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>> {
        let mut prices = HashMap::new();
        let batch_size = self.config.batch_size.max(1);

        for batch in symbols.chunks(batch_size) {
            let result = retry_async(
                "coinmarketcap quotes",
                &self.retry_policy,
                move || self.fetch_batch(batch),
                classify,
            )
            .await;

            // One failing batch must not hide quotes from the others
            match result {
                Ok(found) => prices.extend(found),
                Err(e) => warn!("CoinMarketCap batch of {} symbols failed: {}", batch.len(), e),
            }
        }

        debug!("CoinMarketCap quoted {}/{} symbols", prices.len(), symbols.len());
        Ok(prices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_quotes_takes_first_priced_asset() {
        let body: QuotesResponse = serde_json::from_value(serde_json::json!({
            "status": { "error_code": 0, "error_message": null },
            "data": {
                "ETH": [
                    { "symbol": "ETH", "quote": { "USD": { "price": 3000.5 } } },
                    { "symbol": "ETH", "quote": { "USD": { "price": 0.01 } } }
                ],
                "DEAD": [
                    { "symbol": "DEAD", "quote": { "USD": { "price": null } } }
                ]
            }
        }))
        .unwrap();

        let prices = parse_quotes(body).unwrap();
        assert_eq!(prices.get("eth"), Some(&dec!(3000.5)));
        assert!(!prices.contains_key("dead"));
    }

    #[test]
    fn test_parse_quotes_reports_api_error() {
        let body: QuotesResponse = serde_json::from_value(serde_json::json!({
            "status": { "error_code": 1001, "error_message": "This API Key is invalid." }
        }))
        .unwrap();

        assert!(matches!(parse_quotes(body), Err(PriceError::Api { .. })));
    }

    #[test]
    fn test_rejects_missing_api_key() {
        let config = CoinMarketCapConfig {
            enabled: true,
            api_key: " ".to_string(),
            api_base_url: "https://pro-api.coinmarketcap.com".to_string(),
            request_timeout_seconds: 5,
            batch_size: 10,
        };
        assert!(matches!(CoinMarketCapClient::new(config), Err(PriceError::Config(_))));
    }

    #[test]
    fn test_rate_limit_is_retried() {
        assert_eq!(classify(&PriceError::RateLimited), ErrorClass::RateLimited);
        assert_eq!(
            classify(&PriceError::Api { status: 503, message: String::new() }),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&PriceError::Api { status: 401, message: String::new() }),
            ErrorClass::Permanent
        );
    }
}
