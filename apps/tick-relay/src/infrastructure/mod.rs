//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Shared store adapters (Redis, in-memory).
pub mod store;

/// Upstream market feed over WebSocket.
pub mod upstream;

/// REST quote client used by bulk reads.
pub mod rest;

/// HTTP server: control, reads, health and push.
pub mod http;

/// Configuration loading.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;
