//! Bulk Quote Service
//!
//! Synchronous latest-price reads for cold starts. One multi-key cache
//! read, one batched fallback call for the misses, write-back of whatever
//! the fallback returned. Works whether or not any upstream worker is
//! running for the requested instruments.
//!
//! Failures degrade instead of failing the batch:
//! - cache read fails: every key is treated as a miss
//! - fallback fails: the misses are omitted from the response
//! - write-back or publish fails: logged only

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, warn};

use super::broadcaster::TickBroadcaster;
use super::cache::TickCache;
use super::control::ControlError;
use crate::application::ports::QuoteSource;
use crate::domain::streaming::{InstrumentKey, TickEvent, TickSource};
use crate::infrastructure::metrics::{self, BulkResolution};

/// Bulk read request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuoteRequest {
    /// Instruments as `SEG:ID` or bare ids.
    #[serde(default)]
    pub instrument_keys: Vec<String>,
}

/// Bulk read response. `prices` is keyed by the requested strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuoteResponse {
    /// Prices found, keyed as requested.
    #[serde(serialize_with = "prices_as_numbers")]
    pub prices: BTreeMap<String, Decimal>,
    /// When the response was assembled.
    pub timestamp: DateTime<Utc>,
    /// Distinct instruments served from the cache.
    pub cached_count: usize,
    /// Distinct instruments served from the fallback.
    pub fetched_count: usize,
}

fn prices_as_numbers<S: Serializer>(
    prices: &BTreeMap<String, Decimal>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(prices.iter().map(|(k, v)| (k, v.to_f64())))
}

/// Answers bulk reads from the cache with a REST fallback.
pub struct BulkQuoteService {
    cache: TickCache,
    source: Arc<dyn QuoteSource>,
    broadcaster: Option<TickBroadcaster>,
    default_segment: String,
}

impl std::fmt::Debug for BulkQuoteService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkQuoteService")
            .field("cache", &self.cache)
            .field("default_segment", &self.default_segment)
            .finish_non_exhaustive()
    }
}

impl BulkQuoteService {
    /// Create a service.
    #[must_use]
    pub fn new(
        cache: TickCache,
        source: Arc<dyn QuoteSource>,
        default_segment: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            source,
            broadcaster: None,
            default_segment: default_segment.into(),
        }
    }

    /// Also publish fetched prices as `rest` tick events.
    #[must_use]
    pub fn with_broadcaster(mut self, broadcaster: TickBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Latest prices for `raw_keys`.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InvalidRequest` for an empty list or a
    /// malformed key. Store and fallback failures never fail the call.
    pub async fn get_quotes(&self, raw_keys: &[String]) -> Result<QuoteResponse, ControlError> {
        if raw_keys.is_empty() {
            return Err(ControlError::InvalidRequest(
                "instrument_keys must not be empty".to_string(),
            ));
        }

        // Requested strings, deduplicated, each mapped to an instrument.
        let mut requested: BTreeMap<String, InstrumentKey> = BTreeMap::new();
        for raw in raw_keys {
            let key = InstrumentKey::parse(raw, &self.default_segment)?;
            requested.insert(raw.trim().to_string(), key);
        }
        let mut instruments: Vec<InstrumentKey> = requested.values().cloned().collect();
        instruments.sort();
        instruments.dedup();

        let cached = match self.cache.get_many(&instruments).await {
            Ok(values) => values,
            Err(e) => {
                warn!(error = %e, "Cache read failed; treating all keys as misses");
                vec![None; instruments.len()]
            }
        };

        let mut found: HashMap<InstrumentKey, Decimal> = HashMap::new();
        let mut misses = Vec::new();
        for (key, price) in instruments.iter().zip(cached) {
            match price {
                Some(price) => {
                    found.insert(key.clone(), price);
                }
                None => misses.push(key.clone()),
            }
        }
        let cached_count = found.len();

        let fetched = self.fetch_misses(&misses).await;
        let fetched_count = fetched.len();
        found.extend(fetched);

        let missing = instruments.len() - found.len();
        metrics::record_bulk_keys(BulkResolution::Cached, cached_count as u64);
        metrics::record_bulk_keys(BulkResolution::Fetched, fetched_count as u64);
        metrics::record_bulk_keys(BulkResolution::Missing, missing as u64);
        debug!(
            requested = instruments.len(),
            cached = cached_count,
            fetched = fetched_count,
            missing,
            "Bulk quote served"
        );

        let prices = requested
            .into_iter()
            .filter_map(|(raw, key)| found.get(&key).map(|price| (raw, *price)))
            .collect();

        Ok(QuoteResponse {
            prices,
            timestamp: Utc::now(),
            cached_count,
            fetched_count,
        })
    }

    /// One fallback call for all misses, then write-back and publish.
    async fn fetch_misses(&self, misses: &[InstrumentKey]) -> Vec<(InstrumentKey, Decimal)> {
        if misses.is_empty() {
            return vec![];
        }

        let fetched: Vec<(InstrumentKey, Decimal)> = match self.source.fetch_quotes(misses).await {
            Ok(prices) => misses
                .iter()
                .filter_map(|k| prices.get(k).map(|p| (k.clone(), *p)))
                .collect(),
            Err(e) => {
                metrics::record_fallback_failure();
                warn!(error = %e, misses = misses.len(), "Quote fallback failed; omitting misses");
                return vec![];
            }
        };

        if let Err(e) = self.cache.put_many(&fetched).await {
            warn!(error = %e, "Cache write-back failed");
        }

        if let Some(broadcaster) = &self.broadcaster {
            let now = Utc::now();
            let mut published = 0;
            for (key, price) in &fetched {
                let event = TickEvent {
                    instrument_key: key.clone(),
                    symbol: key.security_id().to_string(),
                    price: *price,
                    timestamp: now,
                    source: TickSource::Rest,
                };
                match broadcaster.publish(&event).await {
                    Ok(_) => published += 1,
                    Err(e) => {
                        warn!(error = %e, "Publishing fetched quote failed");
                        break;
                    }
                }
            }
            metrics::record_ticks_published("rest", published);
        }

        fetched
    }
}
