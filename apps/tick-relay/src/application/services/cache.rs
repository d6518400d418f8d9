//! Latest-price cache over the shared store.
//!
//! One entry per instrument under `price:{segment}:{security_id}`, value is
//! the price as plain text, TTL refreshed on every write. Expired entries
//! read exactly like absent ones because the store drops them.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::warn;

use crate::application::ports::{DEFAULT_STORE_TIMEOUT, KeyValueStore, StoreError, bounded};
use crate::domain::streaming::InstrumentKey;

/// Default lifetime of a cached price.
pub const DEFAULT_TICK_TTL: Duration = Duration::from_secs(30);

/// A cached price with its approximate write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickCacheEntry {
    /// Instrument the price belongs to.
    pub instrument_key: InstrumentKey,
    /// Last written price.
    pub last_price: Decimal,
    /// When the entry was last written, derived from its remaining TTL.
    pub cached_at: DateTime<Utc>,
}

/// Latest-value price cache.
#[derive(Clone)]
pub struct TickCache {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    timeout: Duration,
}

impl std::fmt::Debug for TickCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickCache")
            .field("ttl", &self.ttl)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TickCache {
    /// Create a cache writing entries with `ttl`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Bound every store round trip by `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Entry lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Overwrite the price for one instrument.
    ///
    /// # Errors
    ///
    /// Returns the store error if the write fails.
    pub async fn put(&self, key: &InstrumentKey, price: Decimal) -> Result<(), StoreError> {
        let cache_key = key.cache_key();
        let value = render_price(price);
        bounded(self.timeout, self.store.set(&cache_key, &value, self.ttl)).await
    }

    /// Overwrite prices for many instruments.
    ///
    /// # Errors
    ///
    /// Returns the store error if the write fails.
    pub async fn put_many(&self, prices: &[(InstrumentKey, Decimal)]) -> Result<(), StoreError> {
        if prices.is_empty() {
            return Ok(());
        }
        let entries: Vec<_> = prices
            .iter()
            .map(|(key, price)| (key.cache_key(), render_price(*price)))
            .collect();
        bounded(self.timeout, self.store.set_many(&entries, self.ttl)).await
    }

    /// Read one entry with its write time.
    ///
    /// # Errors
    ///
    /// Returns the store error if the read fails.
    pub async fn get(&self, key: &InstrumentKey) -> Result<Option<TickCacheEntry>, StoreError> {
        let cache_key = key.cache_key();
        let Some(raw) = bounded(self.timeout, self.store.get(&cache_key)).await? else {
            return Ok(None);
        };
        let Some(price) = parse_price(&cache_key, &raw) else {
            return Ok(None);
        };
        let remaining = bounded(self.timeout, self.store.remaining_ttl(&cache_key))
            .await?
            .unwrap_or(self.ttl);
        let age = self.ttl.saturating_sub(remaining);
        let cached_at = Utc::now() - chrono::Duration::from_std(age).unwrap_or_default();

        Ok(Some(TickCacheEntry {
            instrument_key: key.clone(),
            last_price: price,
            cached_at,
        }))
    }

    /// Read many prices in one round trip, in request order.
    ///
    /// Unparseable values are reported as misses.
    ///
    /// # Errors
    ///
    /// Returns the store error if the read fails.
    pub async fn get_many(&self, keys: &[InstrumentKey]) -> Result<Vec<Option<Decimal>>, StoreError> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let cache_keys: Vec<_> = keys.iter().map(InstrumentKey::cache_key).collect();
        let values = bounded(self.timeout, self.store.get_many(&cache_keys)).await?;
        Ok(cache_keys
            .iter()
            .zip(values)
            .map(|(cache_key, raw)| raw.and_then(|raw| parse_price(cache_key, &raw)))
            .collect())
    }
}

fn render_price(price: Decimal) -> String {
    price.normalize().to_string()
}

fn parse_price(cache_key: &str, raw: &str) -> Option<Decimal> {
    match Decimal::from_str(raw.trim()) {
        Ok(price) => Some(price),
        Err(e) => {
            warn!(key = %cache_key, value = %raw, error = %e, "Ignoring unparseable cached price");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::MemoryStore;

    fn key(raw: &str) -> InstrumentKey {
        InstrumentKey::parse(raw, "NSE").unwrap()
    }

    fn cache() -> (TickCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (TickCache::new(store.clone(), DEFAULT_TICK_TTL), store)
    }

    #[tokio::test(start_paused = true)]
    async fn stores_price_text_under_cache_key() {
        let (cache, store) = cache();
        cache.put(&key("NSE:1"), Decimal::new(10150, 2)).await.unwrap();

        let raw = store.get("price:NSE:1").await.unwrap();
        assert_eq!(raw.as_deref(), Some("101.5"));
    }

    #[tokio::test(start_paused = true)]
    async fn rewrite_keeps_single_entry_with_later_time() {
        let (cache, store) = cache();
        let k = key("NSE:1");
        cache.put(&k, Decimal::new(1015, 1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let first = cache.get(&k).await.unwrap().unwrap();

        cache.put(&k, Decimal::new(1015, 1)).await.unwrap();
        let second = cache.get(&k).await.unwrap().unwrap();

        assert!(second.cached_at > first.cached_at);
        assert_eq!(second.last_price, first.last_price);
        assert_eq!(store.keys_with_prefix("price:").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_reads_as_absent() {
        let (cache, _) = cache();
        let k = key("NSE:1");
        cache.put(&k, Decimal::ONE).await.unwrap();

        tokio::time::advance(DEFAULT_TICK_TTL + Duration::from_millis(1)).await;

        assert_eq!(cache.get(&k).await.unwrap(), None);
        assert_eq!(cache.get_many(&[k]).await.unwrap(), vec![None]);
    }

    #[tokio::test(start_paused = true)]
    async fn get_many_preserves_order_and_skips_garbage() {
        let (cache, store) = cache();
        cache
            .put_many(&[(key("NSE:1"), Decimal::ONE), (key("NSE:3"), Decimal::TWO)])
            .await
            .unwrap();
        store
            .set("price:NSE:2", "not-a-price", DEFAULT_TICK_TTL)
            .await
            .unwrap();

        let prices = cache
            .get_many(&[key("NSE:3"), key("NSE:2"), key("NSE:1"), key("NSE:4")])
            .await
            .unwrap();

        assert_eq!(prices, vec![Some(Decimal::TWO), None, Some(Decimal::ONE), None]);
    }
}
