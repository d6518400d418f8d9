//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `KeyValueStore`: shared store with per-key TTL and atomic
//!   conditional writes (leases, tick cache)
//! - `PubSub`: topic broadcast across processes
//! - `UpstreamTransport` / `FeedSession`: the market-data feed connection
//! - `QuoteSource`: point-read REST fallback

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use rust_decimal::Decimal;

use crate::domain::streaming::InstrumentKey;

// =============================================================================
// Shared Store
// =============================================================================

/// Errors from the shared store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Store could not be reached or the connection dropped.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Store replied with something unexpected.
    #[error("store protocol error: {0}")]
    Protocol(String),
    /// Store did not answer within the round-trip bound.
    #[error("store timed out after {0:?}")]
    Timeout(Duration),
}

/// Default bound on one store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Run one store call, failing with `StoreError::Timeout` once `limit`
/// passes without an answer.
///
/// # Errors
///
/// Returns the call's own error, or `StoreError::Timeout`.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

/// Key-value store with per-key TTL shared by every process in the fleet.
///
/// Every conditional operation must be atomic on the store side; callers
/// never emulate them with a read followed by a write.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Check the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Read one key. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Read many keys in one round trip, preserving order.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    /// Remaining lifetime of a key, `None` if absent or without expiry.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Unconditionally write a key with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Write many keys with the same TTL.
    async fn set_many(&self, entries: &[(String, String)], ttl: Duration)
    -> Result<(), StoreError>;

    /// Create a key only if it does not exist. Returns whether it was created.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Replace a key only if it currently holds `expected`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete a key only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// All live keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Stream of raw payloads received on a topic.
pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Topic-based broadcast visible to every process.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a payload. Returns the number of receivers reported by the
    /// store (zero is not an error).
    async fn publish(&self, topic: &str, payload: &str) -> Result<usize, StoreError>;

    /// Subscribe to a topic. The stream ends if the subscription is lost.
    async fn subscribe(&self, topic: &str) -> Result<MessageStream, StoreError>;
}

// =============================================================================
// Upstream Feed
// =============================================================================

/// Errors from the upstream market-data transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("upstream connect failed: {0}")]
    Connect(String),
    /// Connection dropped or was closed by the server.
    #[error("upstream connection closed: {0}")]
    Closed(String),
    /// Server sent data that could not be decoded.
    #[error("upstream protocol error: {0}")]
    Protocol(String),
    /// Operation did not complete in time.
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
}

/// One price update as delivered by the upstream feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTick {
    /// Instrument, using the key the session was subscribed with.
    pub instrument: InstrumentKey,
    /// Last traded price.
    pub price: Decimal,
    /// Exchange trade time, when the feed provides one.
    pub traded_at: Option<DateTime<Utc>>,
}

/// Factory for upstream feed connections.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Open one physical connection.
    async fn connect(&self) -> Result<Box<dyn FeedSession>, TransportError>;
}

/// A live upstream connection.
#[async_trait]
pub trait FeedSession: Send {
    /// Subscribe instruments on this connection.
    async fn subscribe(&mut self, instruments: &[InstrumentKey]) -> Result<(), TransportError>;

    /// Unsubscribe instruments on this connection.
    async fn unsubscribe(&mut self, instruments: &[InstrumentKey]) -> Result<(), TransportError>;

    /// Wait for the next tick. `Ok(None)` means the server ended the stream.
    ///
    /// Must be cancel-safe: it is polled inside `select!`.
    async fn next_tick(&mut self) -> Result<Option<UpstreamTick>, TransportError>;

    /// Close the connection. Errors are swallowed.
    async fn close(&mut self);
}

// =============================================================================
// Quote Fallback
// =============================================================================

/// Errors from the REST quote endpoint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QuoteSourceError {
    /// Request failed before a response arrived.
    #[error("quote request failed: {0}")]
    Request(String),
    /// Endpoint returned a non-success status.
    #[error("quote endpoint returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
    /// Response could not be decoded.
    #[error("quote response decode failed: {0}")]
    Decode(String),
}

/// Batched point-read of latest prices.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Fetch prices for many instruments in one call. Instruments the
    /// endpoint does not know are simply absent from the result.
    async fn fetch_quotes(
        &self,
        instruments: &[InstrumentKey],
    ) -> Result<HashMap<InstrumentKey, Decimal>, QuoteSourceError>;
}
