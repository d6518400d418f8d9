//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (store, feed, quote endpoint).
pub mod ports;

/// Application services: leases, cache, connector, fan-out, bulk reads.
pub mod services;
