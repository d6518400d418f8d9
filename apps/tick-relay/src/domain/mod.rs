//! Domain Layer - Core relay types and rules.
//!
//! This layer contains the types shared by every other layer: keys, tick
//! events, lease records and client interest. Nothing here performs I/O.

/// Lease records and their lifecycle.
pub mod lease;

/// Instrument and stream keys, tick events, push messages.
pub mod streaming;

/// Per-session interest tracking.
pub mod subscription;
