//! Configuration Module
//!
//! Environment-driven configuration for the relay.

mod settings;

pub use settings::{
    ConfigError, Credentials, FeedSettings, LeaseSettings, PushSettings, RelayConfig,
    ServerSettings, StoreSettings,
};
