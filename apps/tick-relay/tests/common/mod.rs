//! Shared fixtures for integration tests.
//!
//! An `Instance` wires one relay process against a shared in-memory store
//! and a scripted upstream, so several instances can contend for the same
//! leases inside one test.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use tick_relay::application::ports::{
    DEFAULT_STORE_TIMEOUT, FeedSession, QuoteSource, QuoteSourceError, TransportError, UpstreamTick,
    UpstreamTransport,
};
use tick_relay::application::services::{
    BulkQuoteService, ClientFanout, ConnectorSettings, HealthMonitor, ReconnectConfig,
    StartRequest, StreamController, StreamRegistry, SubscriberBridge, TickBroadcaster, TickCache,
    UpstreamFeedConnector,
};
use tick_relay::domain::streaming::{ClientContract, InstrumentKey};
use tick_relay::infrastructure::http::AppState;
use tick_relay::infrastructure::store::MemoryStore;

pub const TOPIC: &str = "ticks";

pub fn key(raw: &str) -> InstrumentKey {
    InstrumentKey::parse(raw, "NSE").unwrap()
}

pub fn start_request(ids: &[&str]) -> StartRequest {
    StartRequest {
        subscription_type: "swing".to_string(),
        instrument_keys: ids.iter().map(ToString::to_string).collect(),
        ..StartRequest::default()
    }
}

// =============================================================================
// Scripted upstream
// =============================================================================

type TickFeed = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<UpstreamTick>>>;

/// Upstream whose sessions read ticks pushed by the test.
pub struct ScriptedTransport {
    feed: TickFeed,
    sender: mpsc::UnboundedSender<UpstreamTick>,
    connects: AtomicUsize,
    subscribed: Arc<Mutex<Vec<Vec<InstrumentKey>>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            feed: Arc::new(tokio::sync::Mutex::new(receiver)),
            sender,
            connects: AtomicUsize::new(0),
            subscribed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a tick for whichever session reads next.
    pub fn push(&self, instrument: &str, price: Decimal) {
        self.sender
            .send(UpstreamTick {
                instrument: key(instrument),
                price,
                traded_at: None,
            })
            .unwrap();
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<Vec<InstrumentKey>> {
        self.subscribed.lock().clone()
    }
}

struct ScriptedSession {
    feed: TickFeed,
    subscribed: Arc<Mutex<Vec<Vec<InstrumentKey>>>>,
}

#[async_trait]
impl UpstreamTransport for ScriptedTransport {
    async fn connect(&self) -> Result<Box<dyn FeedSession>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            feed: Arc::clone(&self.feed),
            subscribed: Arc::clone(&self.subscribed),
        }))
    }
}

#[async_trait]
impl FeedSession for ScriptedSession {
    async fn subscribe(&mut self, instruments: &[InstrumentKey]) -> Result<(), TransportError> {
        self.subscribed.lock().push(instruments.to_vec());
        Ok(())
    }

    async fn unsubscribe(&mut self, _instruments: &[InstrumentKey]) -> Result<(), TransportError> {
        Ok(())
    }

    async fn next_tick(&mut self) -> Result<Option<UpstreamTick>, TransportError> {
        Ok(self.feed.lock().await.recv().await)
    }

    async fn close(&mut self) {}
}

/// Upstream that refuses every connection.
pub struct RefusingTransport;

#[async_trait]
impl UpstreamTransport for RefusingTransport {
    async fn connect(&self) -> Result<Box<dyn FeedSession>, TransportError> {
        Err(TransportError::Connect("connection refused".to_string()))
    }
}

// =============================================================================
// Quote fallback
// =============================================================================

/// Fallback answering from a fixed price table.
#[derive(Default)]
pub struct StaticQuotes {
    prices: HashMap<InstrumentKey, Decimal>,
    calls: AtomicUsize,
    fail: bool,
}

impl StaticQuotes {
    pub fn with_prices(prices: &[(&str, Decimal)]) -> Self {
        Self {
            prices: prices.iter().map(|(k, p)| (key(k), *p)).collect(),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuoteSource for StaticQuotes {
    async fn fetch_quotes(
        &self,
        instruments: &[InstrumentKey],
    ) -> Result<HashMap<InstrumentKey, Decimal>, QuoteSourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(QuoteSourceError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(instruments
            .iter()
            .filter_map(|k| self.prices.get(k).map(|p| (k.clone(), *p)))
            .collect())
    }
}

// =============================================================================
// Relay instance
// =============================================================================

/// One relay process wired against a shared store.
pub struct Instance {
    pub store: Arc<MemoryStore>,
    pub registry: StreamRegistry,
    pub cache: TickCache,
    pub transport: Arc<ScriptedTransport>,
    pub quotes_source: Arc<StaticQuotes>,
    pub controller: Arc<StreamController>,
    pub monitor: Arc<HealthMonitor>,
    pub quotes: Arc<BulkQuoteService>,
    pub fanout: Arc<ClientFanout>,
    pub bridge: Arc<SubscriberBridge>,
}

impl Instance {
    pub fn new(store: &Arc<MemoryStore>, name: &str) -> Self {
        Self::with_quotes(store, name, StaticQuotes::default())
    }

    pub fn with_quotes(store: &Arc<MemoryStore>, name: &str, quotes_source: StaticQuotes) -> Self {
        let registry = StreamRegistry::new(store.clone());
        let cache = TickCache::new(store.clone(), Duration::from_secs(30));
        let broadcaster = TickBroadcaster::new(store.clone(), TOPIC);
        let transport = Arc::new(ScriptedTransport::new());
        let connector = Arc::new(UpstreamFeedConnector::new(
            registry.clone(),
            cache.clone(),
            broadcaster.clone(),
            transport.clone(),
            ConnectorSettings::default(),
        ));
        let controller = Arc::new(StreamController::new(
            registry.clone(),
            connector,
            name,
            "NSE",
        ));
        let quotes_source = Arc::new(quotes_source);
        let quotes = Arc::new(
            BulkQuoteService::new(cache.clone(), quotes_source.clone(), "NSE")
                .with_broadcaster(broadcaster),
        );
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            Duration::from_secs(30),
            Duration::from_secs(300),
        ));
        let fanout = Arc::new(ClientFanout::new(16));
        let bridge = Arc::new(SubscriberBridge::new(
            store.clone(),
            TOPIC,
            fanout.clone(),
            ReconnectConfig::default(),
        ));

        Self {
            store: store.clone(),
            registry,
            cache,
            transport,
            quotes_source,
            controller,
            monitor,
            quotes,
            fanout,
            bridge,
        }
    }

    /// HTTP state over this instance.
    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            controller: self.controller.clone(),
            quotes: self.quotes.clone(),
            monitor: self.monitor.clone(),
            registry: self.registry.clone(),
            fanout: self.fanout.clone(),
            bridge: self.bridge.clone(),
            store: self.store.clone(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            contract: ClientContract::default(),
            default_segment: "NSE".to_string(),
            version: "test".to_string(),
            started_at: Instant::now(),
        })
    }
}

/// Yield until `check` holds, advancing a paused clock if needed.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(check(), "condition not reached");
}
