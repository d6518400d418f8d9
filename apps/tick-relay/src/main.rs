//! Tick Relay Binary
//!
//! Starts the market tick relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin tick-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `FEED_CLIENT_ID`: feed account id
//! - `FEED_ACCESS_TOKEN`: feed access token
//!
//! ## Optional
//! - `STORE_URL`: `redis://...` or `memory://` (default: redis://127.0.0.1:6379)
//! - `FEED_WS_URL`, `QUOTE_API_URL`: upstream endpoints
//! - `HTTP_PORT`: HTTP port (default: 8080)
//! - `OWNER_ID`: instance id used in lease owners (default: host plus random suffix)
//! - `DEFAULT_SEGMENT`: segment for bare instrument ids (default: NSE)
//! - `LEASE_TTL_SECS` (120), `LEASE_REFRESH_SECS` (30), `RESUBSCRIBE_SECS` (300),
//!   `HEALTH_SWEEP_SECS` (300), `TICK_CACHE_TTL_SECS` (30)
//! - `CLIENT_BUFFER` (256), `BROADCAST_TOPIC` (ticks)
//! - `STORE_TIMEOUT_MS` (2000): bound on one store round trip
//! - `LOG_FORMAT`: `json` for JSON logs
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: log filter

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tick_relay::application::services::{
    BulkQuoteService, ClientFanout, HealthMonitor, StreamController, StreamRegistry,
    SubscriberBridge, TickBroadcaster, TickCache, UpstreamFeedConnector,
};
use tick_relay::infrastructure::http::{AppState, HttpServer};
use tick_relay::infrastructure::rest::LtpClient;
use tick_relay::infrastructure::store::SharedStore;
use tick_relay::infrastructure::telemetry;
use tick_relay::infrastructure::upstream::{FeedConfig, WebSocketTransport};
use tick_relay::{RelayConfig, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting Tick Relay");

    init_metrics().context("failed to install metrics recorder")?;

    let config = RelayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Shared store: leases, tick cache and broadcast topic
    let store = SharedStore::open(&config.store.url, config.store.timeout)
        .await
        .context("failed to open shared store")?;

    let store_timeout = config.store.timeout;
    let registry = StreamRegistry::new(Arc::clone(&store.kv)).with_timeout(store_timeout);
    let cache = TickCache::new(Arc::clone(&store.kv), config.store.tick_ttl).with_timeout(store_timeout);
    let broadcaster = TickBroadcaster::new(Arc::clone(&store.bus), config.store.broadcast_topic.clone())
        .with_timeout(store_timeout);

    // Upstream workers
    let transport = Arc::new(WebSocketTransport::new(FeedConfig {
        url: config.feed.ws_url.clone(),
        credentials: config.feed.credentials.clone(),
        idle_timeout: config.feed.idle_timeout,
    }));
    let connector = Arc::new(UpstreamFeedConnector::new(
        registry.clone(),
        cache.clone(),
        broadcaster.clone(),
        transport,
        config.connector_settings(),
    ));
    let controller = Arc::new(StreamController::new(
        registry.clone(),
        connector,
        config.instance_id.clone(),
        config.default_segment.clone(),
    ));

    // Bulk reads
    let quote_source = Arc::new(LtpClient::new(
        config.feed.quote_api_url.clone(),
        &config.feed.credentials,
        config.feed.request_timeout,
    )?);
    let quotes = Arc::new(
        BulkQuoteService::new(cache, quote_source, config.default_segment.clone())
            .with_broadcaster(broadcaster),
    );

    // Lease health
    let monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        config.lease.refresh_interval,
        config.lease.sweep_interval,
    ));

    // Push fan-out
    let fanout = Arc::new(ClientFanout::new(config.push.client_buffer));
    let bridge = Arc::new(
        SubscriberBridge::new(
            Arc::clone(&store.bus),
            config.store.broadcast_topic.clone(),
            Arc::clone(&fanout),
            config.reconnect.clone(),
        )
        .with_timeout(store_timeout),
    );

    let state = Arc::new(AppState {
        controller: Arc::clone(&controller),
        quotes,
        monitor: Arc::clone(&monitor),
        registry,
        fanout,
        bridge: Arc::clone(&bridge),
        store: Arc::clone(&store.kv),
        store_timeout,
        contract: config.client_contract(),
        default_segment: config.default_segment.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at: Instant::now(),
    });

    // Spawn subscriber bridge
    let bridge_cancel = shutdown_token.clone();
    let bridge_handle = tokio::spawn(async move { bridge.run(bridge_cancel).await });

    // Spawn lease health monitor
    let monitor_cancel = shutdown_token.clone();
    let monitor_handle = tokio::spawn(async move { monitor.run(monitor_cancel).await });

    // Spawn HTTP server
    let http_server = HttpServer::new(config.server.http_port, state, shutdown_token.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!(instance_id = %config.instance_id, "Tick relay ready");

    await_shutdown(shutdown_token).await;

    // Release every lease this process holds so another instance can take over.
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, controller.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Timed out releasing stream leases");
    }
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = tokio::join!(server_handle, bridge_handle, monitor_handle);
    })
    .await;

    tracing::info!("Tick relay stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        instance_id = %config.instance_id,
        http_port = config.server.http_port,
        default_segment = %config.default_segment,
        lease_ttl_secs = config.lease.ttl.as_secs(),
        refresh_secs = config.lease.refresh_interval.as_secs(),
        tick_ttl_secs = config.store.tick_ttl.as_secs(),
        store_timeout_ms = u64::try_from(config.store.timeout.as_millis()).unwrap_or(u64::MAX),
        "Configuration loaded"
    );
    tracing::debug!(
        feed_url = %config.feed.ws_url,
        quote_api_url = %config.feed.quote_api_url,
        topic = %config.store.broadcast_topic,
        "Upstream endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
