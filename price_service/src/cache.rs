use async_trait::async_trait;
use persistence_layer::RedisClient;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::warn;

use crate::Result;

/// Symbol-keyed price store shared across jobs. Keys are case-insensitive.
#[async_trait]
pub trait PriceCache: Send + Sync {
    async fn get(&self, symbol: &str) -> Result<Option<Decimal>>;

    async fn set(&self, symbol: &str, price: Decimal, ttl: Duration) -> Result<()>;

    /// Look up several symbols; misses are simply absent from the result
    async fn get_many(&self, symbols: &[String]) -> Result<HashMap<String, Decimal>> {
        let mut found = HashMap::new();
        for symbol in symbols {
            if let Some(price) = self.get(symbol).await? {
                found.insert(symbol.to_lowercase(), price);
            }
        }
        Ok(found)
    }
}

fn cache_key(symbol: &str) -> String {
    format!("price:{}", symbol.to_lowercase())
}

#[derive(Default)]
pub struct InMemoryPriceCache {
    entries: RwLock<HashMap<String, (Decimal, Instant)>>,
}

impl InMemoryPriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries, returning how many were removed
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        before - entries.len()
    }
}

#[async_trait]
impl PriceCache for InMemoryPriceCache {
    async fn get(&self, symbol: &str) -> Result<Option<Decimal>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&cache_key(symbol))
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(price, _)| *price))
    }

    async fn set(&self, symbol: &str, price: Decimal, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(cache_key(symbol), (price, Instant::now() + ttl));
        Ok(())
    }
}

/// Price cache stored as plain decimal strings with a Redis TTL
#[derive(Clone)]
pub struct RedisPriceCache {
    client: RedisClient,
}

impl RedisPriceCache {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PriceCache for RedisPriceCache {
    async fn get(&self, symbol: &str) -> Result<Option<Decimal>> {
        let Some(raw) = self.client.get_cached_data(&cache_key(symbol)).await? else {
            return Ok(None);
        };
        match Decimal::from_str(&raw) {
            Ok(price) => Ok(Some(price)),
            Err(e) => {
                warn!("Ignoring malformed cached price for {}: {}", symbol, e);
                Ok(None)
            }
        }
    }

    async fn set(&self, symbol: &str, price: Decimal, ttl: Duration) -> Result<()> {
        self.client
            .set_with_expiry(&cache_key(symbol), &price.to_string(), ttl.as_secs().max(1))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_lookup_is_case_insensitive() {
        let cache = InMemoryPriceCache::new();
        cache.set("WETH", dec!(3000), Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.get("weth").await.unwrap(), Some(dec!(3000)));
        let many = cache
            .get_many(&["Weth".to_string(), "USDC".to_string()])
            .await
            .unwrap();
        assert_eq!(many.len(), 1);
        assert_eq!(many.get("weth"), Some(&dec!(3000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = InMemoryPriceCache::new();
        cache.set("SOL", dec!(150), Duration::from_secs(30)).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(cache.get("SOL").await.unwrap(), None);
        assert_eq!(cache.evict_expired().await, 1);
    }
}
