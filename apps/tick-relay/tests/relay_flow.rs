//! Relay Flow Integration Tests
//!
//! Ticks travel upstream → cache → broadcast topic → subscriber bridge →
//! push sessions, and bulk reads are served from the same cache.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use common::{Instance, StaticQuotes, key, start_request};
use tick_relay::application::services::StartStatus;
use tick_relay::domain::streaming::TickSource;
use tick_relay::infrastructure::store::MemoryStore;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn spawn_bridge(instance: &Instance, cancel: &CancellationToken) -> tokio::task::JoinHandle<()> {
    let bridge = instance.bridge.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move { bridge.run(cancel).await })
}

fn raw(keys: &[&str]) -> Vec<String> {
    keys.iter().map(ToString::to_string).collect()
}

#[tokio::test]
async fn upstream_tick_reaches_push_session_and_cache() {
    let store = Arc::new(MemoryStore::new());
    let relay = Instance::new(&store, "relay-a");
    let cancel = CancellationToken::new();
    let bridge_task = spawn_bridge(&relay, &cancel);
    relay.bridge.wait_subscribed().await;

    let (session, mut rx) = relay.fanout.connect();
    relay.fanout.set_interest(session, &[key("NSE:1")]);

    let started = relay
        .controller
        .start(start_request(&["1", "2", "3"]))
        .await
        .unwrap();
    assert_eq!(started.status, StartStatus::Started);
    assert_eq!(started.stream_key, "type:swing|ids:1,2,3");

    relay.transport.push("NSE:1", Decimal::new(1015, 1));

    let event = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.instrument_key, key("NSE:1"));
    assert_eq!(event.price, Decimal::new(1015, 1));
    assert_eq!(event.source, TickSource::Websocket);

    let quotes = relay.quotes.get_quotes(&raw(&["NSE:1"])).await.unwrap();
    assert_eq!(quotes.prices.get("NSE:1"), Some(&Decimal::new(1015, 1)));
    assert_eq!(quotes.cached_count, 1);
    assert_eq!(quotes.fetched_count, 0);
    assert_eq!(relay.quotes_source.calls(), 0);

    relay.controller.shutdown().await;
    cancel.cancel();
    bridge_task.await.unwrap();
}

#[tokio::test]
async fn ticks_fan_out_to_sessions_on_every_instance() {
    let store = Arc::new(MemoryStore::new());
    let owner = Instance::new(&store, "relay-a");
    let follower = Instance::new(&store, "relay-b");
    let cancel = CancellationToken::new();
    let tasks = [spawn_bridge(&owner, &cancel), spawn_bridge(&follower, &cancel)];
    owner.bridge.wait_subscribed().await;
    follower.bridge.wait_subscribed().await;

    let (local, mut local_rx) = owner.fanout.connect();
    owner.fanout.set_interest(local, &[key("NSE:2")]);
    let (remote, mut remote_rx) = follower.fanout.connect();
    follower.fanout.set_interest(remote, &[key("NSE:2"), key("NSE:3")]);
    let (uninterested, mut uninterested_rx) = follower.fanout.connect();
    follower.fanout.set_interest(uninterested, &[key("NSE:9")]);

    owner.controller.start(start_request(&["1", "2", "3"])).await.unwrap();
    let again = follower
        .controller
        .start(start_request(&["1", "2", "3"]))
        .await
        .unwrap();
    assert_eq!(again.status, StartStatus::AlreadyRunning);

    owner.transport.push("NSE:2", Decimal::new(250, 0));
    owner.transport.push("NSE:3", Decimal::new(300, 0));

    let first = timeout(RECV_TIMEOUT, local_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.instrument_key, key("NSE:2"));

    let a = timeout(RECV_TIMEOUT, remote_rx.recv()).await.unwrap().unwrap();
    let b = timeout(RECV_TIMEOUT, remote_rx.recv()).await.unwrap().unwrap();
    assert_eq!(a.instrument_key, key("NSE:2"));
    assert_eq!(b.instrument_key, key("NSE:3"));
    assert!(uninterested_rx.try_recv().is_err());
    assert_eq!(follower.transport.connects(), 0);

    owner.controller.shutdown().await;
    cancel.cancel();
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn bulk_read_mixes_cache_and_fallback() {
    let store = Arc::new(MemoryStore::new());
    let relay = Instance::with_quotes(
        &store,
        "relay-a",
        StaticQuotes::with_prices(&[("NSE:2", Decimal::new(200, 0))]),
    );
    relay.cache.put(&key("NSE:1"), Decimal::new(100, 0)).await.unwrap();

    let first = relay
        .quotes
        .get_quotes(&raw(&["NSE:1", "2", "NSE:3"]))
        .await
        .unwrap();
    assert_eq!(first.prices.len(), 2);
    assert_eq!(first.prices.get("NSE:1"), Some(&Decimal::new(100, 0)));
    assert_eq!(first.prices.get("2"), Some(&Decimal::new(200, 0)));
    assert!(!first.prices.contains_key("NSE:3"));
    assert_eq!(first.cached_count, 1);
    assert_eq!(first.fetched_count, 1);
    assert_eq!(relay.quotes_source.calls(), 1);

    // The fetched price was written back.
    let second = relay
        .quotes
        .get_quotes(&raw(&["NSE:1", "NSE:2"]))
        .await
        .unwrap();
    assert_eq!(second.cached_count, 2);
    assert_eq!(relay.quotes_source.calls(), 1);
}

#[tokio::test]
async fn failing_fallback_returns_cached_subset() {
    let store = Arc::new(MemoryStore::new());
    let relay = Instance::with_quotes(&store, "relay-a", StaticQuotes::failing());
    relay.cache.put(&key("NSE:1"), Decimal::new(100, 0)).await.unwrap();

    let response = relay
        .quotes
        .get_quotes(&raw(&["NSE:1", "NSE:2"]))
        .await
        .unwrap();

    assert_eq!(response.prices.len(), 1);
    assert_eq!(response.cached_count, 1);
    assert_eq!(response.fetched_count, 0);
    assert_eq!(relay.quotes_source.calls(), 1);
}

#[tokio::test]
async fn fetched_quotes_are_pushed_as_rest_ticks() {
    let store = Arc::new(MemoryStore::new());
    let relay = Instance::with_quotes(
        &store,
        "relay-a",
        StaticQuotes::with_prices(&[("NSE:5", Decimal::new(55, 0))]),
    );
    let cancel = CancellationToken::new();
    let bridge_task = spawn_bridge(&relay, &cancel);
    relay.bridge.wait_subscribed().await;

    let (session, mut rx) = relay.fanout.connect();
    relay.fanout.set_interest(session, &[key("NSE:5")]);

    relay.quotes.get_quotes(&raw(&["5"])).await.unwrap();

    let event = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.instrument_key, key("NSE:5"));
    assert_eq!(event.source, TickSource::Rest);

    cancel.cancel();
    bridge_task.await.unwrap();
}
