//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `StreamRegistry`: lease acquire/refresh/release over the shared store
//! - `UpstreamFeedConnector`: one worker per owned stream key
//! - `StreamController`: start/stop/interest control surface
//! - `HealthMonitor`: periodic reclaim of expired leases
//! - `SubscriberBridge` + `ClientFanout`: broadcast topic to push sessions
//! - `BulkQuoteService`: cache-first bulk reads with REST fallback

pub mod bridge;
pub mod broadcaster;
pub mod cache;
pub mod connector;
pub mod control;
pub mod fanout;
pub mod health;
pub mod quotes;
pub mod reconnect;
pub mod registry;

pub use bridge::SubscriberBridge;
pub use broadcaster::{DEFAULT_TOPIC, TickBroadcaster};
pub use cache::{DEFAULT_TICK_TTL, TickCache, TickCacheEntry};
pub use connector::{ConnectorError, ConnectorSettings, StreamContext, StreamExit, UpstreamFeedConnector};
pub use control::{
    ControlError, InterestRequest, StartRequest, StartResponse, StartStatus, StopRequest,
    StopResponse, StopStatus, StreamController,
};
pub use fanout::{ClientFanout, DEFAULT_CLIENT_BUFFER, DeliveryReport};
pub use health::{HealthMonitor, StreamHealth, StreamHealthStatus, SweepReport};
pub use quotes::{BulkQuoteService, QuoteRequest, QuoteResponse};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use registry::{AcquireOutcome, LeaseRecord, RefreshOutcome, RegistryError, StreamRegistry};
