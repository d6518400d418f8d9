#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::option_if_let_else,
        clippy::items_after_statements
    )
)]

//! Tick Relay - Lease-Coordinated Market Data Fan-out
//!
//! Holds at most one upstream feed connection per stream key across a fleet
//! of processes and fans the ticks out to browser sessions, with a TTL cache
//! answering cold-start bulk reads.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: keys, ticks, leases and interest sets
//!   - `streaming`: instrument and stream keys, tick events, push messages
//!   - `lease`: stream lease records and their state machine
//!   - `subscription`: per-session interest index
//!
//! - **Application**: ports and services
//!   - `ports`: shared store, upstream feed and quote source interfaces
//!   - `services`: registry, connector, controller, health, fan-out, bulk reads
//!
//! - **Infrastructure**: adapters
//!   - `store`: Redis and in-memory stores
//!   - `upstream`: WebSocket feed transport
//!   - `rest`: REST quote fallback
//!   - `http`: axum server for every external surface
//!   - `config`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                  lease owner (one per stream key, fleet-wide)
//! upstream WS ──► UpstreamFeedConnector ──► TickCache (price:*, TTL)
//!                                      └──► broadcast topic ──► SubscriberBridge (every process)
//!                                                                   └──► ClientFanout ──► /ws sessions
//! POST /quotes ──► TickCache ──miss──► REST fallback ──► write-back
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Keys, ticks and leases with no I/O.
pub mod domain;

/// Application layer - Ports and services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::lease::{LeaseState, StreamLease};
pub use domain::streaming::{
    ClientContract, InstrumentKey, KeyError, PushMessage, StreamKey, TickEvent, TickSource,
};

// Services
pub use application::services::{
    BulkQuoteService, ClientFanout, ControlError, HealthMonitor, StreamController, StreamRegistry,
    SubscriberBridge, TickBroadcaster, TickCache, UpstreamFeedConnector,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, Credentials, RelayConfig};

// HTTP server
pub use infrastructure::http::{AppState, HttpServer, HttpServerError, create_router};

// Stores
pub use infrastructure::store::{MemoryStore, RedisStore, SharedStore};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
