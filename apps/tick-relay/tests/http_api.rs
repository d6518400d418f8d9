//! HTTP API Integration Tests
//!
//! Drives the router in-process with `tower::ServiceExt::oneshot`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{Instance, StaticQuotes, key};
use tick_relay::infrastructure::http::create_router;
use tick_relay::infrastructure::store::MemoryStore;

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, body)
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

fn relay() -> (Instance, Router) {
    let store = Arc::new(MemoryStore::new());
    let instance = Instance::with_quotes(
        &store,
        "relay-a",
        StaticQuotes::with_prices(&[("NSE:2", Decimal::new(200, 0))]),
    );
    let router = create_router(instance.app_state());
    (instance, router)
}

#[tokio::test]
async fn start_list_and_stop_stream() {
    let (relay, app) = relay();
    let start = json!({
        "subscription_type": "swing",
        "instrument_keys": ["1", "2", "3"],
    });

    let (status, body) = post(&app, "/streams/start", start.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "started");
    assert_eq!(body["stream_key"], "type:swing|ids:1,2,3");

    let (_, body) = post(&app, "/streams/start", start).await;
    assert_eq!(body["status"], "already_running");

    let (status, body) = get(&app, "/streams").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["leases"].as_array().unwrap().len(), 1);
    assert_eq!(body["leases"][0]["stream_key"], "type:swing|ids:1,2,3");
    assert_eq!(body["local_streams"], json!(["type:swing|ids:1,2,3"]));

    let (status, body) = get(&app, "/streams/health?stream_key=type:swing%7Cids:1,2,3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = post(
        &app,
        "/streams/stop",
        json!({ "stream_key": "type:swing|ids:1,2,3" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");

    let (_, body) = get(&app, "/streams/health?stream_key=type:swing%7Cids:1,2,3").await;
    assert_eq!(body["status"], "not_running");
    assert!(relay.controller.local_streams().is_empty());
}

#[tokio::test]
async fn background_start_is_queued() {
    let (relay, app) = relay();

    let (status, body) = post(
        &app,
        "/streams/start",
        json!({
            "subscription_type": "swing",
            "instrument_keys": ["7"],
            "background": true,
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    assert!(body["lease_owner"].as_str().unwrap().starts_with("relay-a:"));
    relay.controller.shutdown().await;
}

#[tokio::test]
async fn invalid_requests_return_error_body() {
    let (_relay, app) = relay();

    let (status, body) = post(
        &app,
        "/streams/start",
        json!({ "subscription_type": "swing", "instrument_keys": [] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "invalid_request");

    let (status, body) = post(
        &app,
        "/streams/start",
        json!({ "subscription_type": "", "instrument_keys": ["1"] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "invalid_request");

    let request = Request::post("/quotes")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "invalid_request");

    let (status, _) = post(&app, "/streams/stop", json!({ "stream_key": "garbage" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn bulk_quotes_endpoint() {
    let (relay, app) = relay();
    relay.cache.put(&key("NSE:1"), Decimal::new(1015, 1)).await.unwrap();

    let (status, body) = post(
        &app,
        "/quotes",
        json!({ "instrument_keys": ["NSE:1", "NSE:2", "NSE:3"] }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["prices"]["NSE:1"], 101.5);
    assert_eq!(body["prices"]["NSE:2"], 200.0);
    assert!(body["prices"].get("NSE:3").is_none());
    assert_eq!(body["cached_count"], 1);
    assert_eq!(body["fetched_count"], 1);
}

#[tokio::test]
async fn interest_update_without_local_worker_not_accepted() {
    let (_relay, app) = relay();

    let (status, body) = post(
        &app,
        "/streams/interest",
        json!({ "stream_key": "type:swing|ids:1", "instrument_keys": ["1", "2"] }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], false);
}

#[tokio::test]
async fn liveness_and_health() {
    let (_relay, app) = relay();

    let (status, body) = get(&app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".to_string()));

    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store_reachable"], true);
    assert_eq!(body["broadcast_subscribed"], false);
    assert_eq!(body["status"], "degraded");

    let (status, _) = get(&app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

type ClientSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Next text frame as JSON.
async fn next_json(socket: &mut ClientSocket) -> Value {
    use futures::StreamExt;
    use tokio_tungstenite::tungstenite::Message;

    loop {
        let message = tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn push_channel_delivers_subscribed_ticks() {
    use futures::SinkExt;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_util::sync::CancellationToken;

    let (relay, app) = relay();
    let cancel = CancellationToken::new();
    let bridge = relay.bridge.clone();
    let bridge_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { bridge.run(cancel).await }
    });
    relay.bridge.wait_subscribed().await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();

    let hello = next_json(&mut socket).await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["bulk_endpoint"], "/quotes");

    socket
        .send(Message::Text(
            json!({ "action": "set", "instrument_keys": ["NSE:1"] })
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
    socket
        .send(Message::Text(json!({ "action": "shout" }).to_string().into()))
        .await
        .unwrap();
    let error = next_json(&mut socket).await;
    assert_eq!(error["type"], "error");

    // The error reply proves the earlier `set` was applied.
    relay.controller.start(common::start_request(&["1", "2", "3"])).await.unwrap();
    relay.transport.push("NSE:2", Decimal::new(2, 0));
    relay.transport.push("NSE:1", Decimal::new(1015, 1));

    let update = next_json(&mut socket).await;
    assert_eq!(update["type"], "tick_update");
    assert_eq!(update["instrument_key"], "NSE:1");

    relay.controller.shutdown().await;
    cancel.cancel();
    bridge_task.await.unwrap();
    server.abort();
}
