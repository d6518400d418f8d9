//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.
//! Every value except the feed credentials has a default.

use std::time::Duration;

use crate::application::ports::DEFAULT_STORE_TIMEOUT;
use crate::application::services::{ConnectorSettings, ReconnectConfig};
use crate::domain::streaming::ClientContract;

/// Upstream feed credentials.
#[derive(Clone)]
pub struct Credentials {
    client_id: String,
    access_token: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(client_id: String, access_token: String) -> Self {
        Self {
            client_id,
            access_token,
        }
    }

    /// Account identifier.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Access token.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &"[REDACTED]")
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// Upstream feed and REST fallback settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// WebSocket feed URL, without credentials.
    pub ws_url: String,
    /// REST quote API base URL.
    pub quote_api_url: String,
    /// Feed credentials.
    pub credentials: Credentials,
    /// Silence on the feed socket after which the connection is dropped.
    pub idle_timeout: Duration,
    /// REST fallback request timeout.
    pub request_timeout: Duration,
}

/// Shared store settings.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// `memory://` or a `redis://` URL.
    pub url: String,
    /// Broadcast topic for tick events.
    pub broadcast_topic: String,
    /// Tick cache entry TTL.
    pub tick_ttl: Duration,
    /// Bound on one store round trip.
    pub timeout: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            broadcast_topic: "ticks".to_string(),
            tick_ttl: Duration::from_secs(30),
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

/// Lease timing settings.
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    /// Lease TTL.
    pub ttl: Duration,
    /// Heartbeat period.
    pub refresh_interval: Duration,
    /// Full re-subscribe period.
    pub resubscribe_interval: Duration,
    /// Health sweep period.
    pub sweep_interval: Duration,
    /// Budget for connect plus subscribe on start.
    pub connect_timeout: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(120),
            refresh_interval: Duration::from_secs(30),
            resubscribe_interval: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Push channel settings.
#[derive(Debug, Clone)]
pub struct PushSettings {
    /// Per-session outbound buffer.
    pub client_buffer: usize,
    /// Poll interval advertised to clients.
    pub poll_interval: Duration,
    /// Push silence advertised to clients.
    pub push_silence: Duration,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            client_buffer: 256,
            poll_interval: Duration::from_secs(5),
            push_silence: Duration::from_secs(15),
        }
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// HTTP port for control, reads, health, metrics and push.
    pub http_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { http_port: 8080 }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Identifier of this process in lease owner ids.
    pub instance_id: String,
    /// Segment applied to bare instrument ids.
    pub default_segment: String,
    /// Upstream settings.
    pub feed: FeedSettings,
    /// Store settings.
    pub store: StoreSettings,
    /// Lease settings.
    pub lease: LeaseSettings,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Push settings.
    pub push: PushSettings,
    /// Server settings.
    pub server: ServerSettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from any key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let client_id = env.required("FEED_CLIENT_ID")?;
        let access_token = env.required("FEED_ACCESS_TOKEN")?;

        let feed = FeedSettings {
            ws_url: env.string("FEED_WS_URL", "wss://api-feed.dhan.co"),
            quote_api_url: env.string("QUOTE_API_URL", "https://api.dhan.co/v2"),
            credentials: Credentials::new(client_id, access_token),
            idle_timeout: env.secs("FEED_IDLE_TIMEOUT_SECS", Duration::from_secs(60))?,
            request_timeout: env.secs("QUOTE_REQUEST_TIMEOUT_SECS", Duration::from_secs(5))?,
        };

        let store_defaults = StoreSettings::default();
        let store = StoreSettings {
            url: env.string("STORE_URL", &store_defaults.url),
            broadcast_topic: env.string("BROADCAST_TOPIC", &store_defaults.broadcast_topic),
            tick_ttl: env.secs("TICK_CACHE_TTL_SECS", store_defaults.tick_ttl)?,
            timeout: env.millis("STORE_TIMEOUT_MS", store_defaults.timeout)?,
        };

        let lease_defaults = LeaseSettings::default();
        let lease = LeaseSettings {
            ttl: env.secs("LEASE_TTL_SECS", lease_defaults.ttl)?,
            refresh_interval: env.secs("LEASE_REFRESH_SECS", lease_defaults.refresh_interval)?,
            resubscribe_interval: env
                .secs("RESUBSCRIBE_SECS", lease_defaults.resubscribe_interval)?,
            sweep_interval: env.secs("HEALTH_SWEEP_SECS", lease_defaults.sweep_interval)?,
            connect_timeout: env.secs("CONNECT_TIMEOUT_SECS", lease_defaults.connect_timeout)?,
        };
        if lease.refresh_interval.is_zero() || lease.refresh_interval >= lease.ttl {
            return Err(ConfigError::Invalid {
                key: "LEASE_REFRESH_SECS".to_string(),
                reason: "must be non-zero and shorter than LEASE_TTL_SECS".to_string(),
            });
        }
        if store.timeout.is_zero() || store.timeout >= lease.refresh_interval {
            return Err(ConfigError::Invalid {
                key: "STORE_TIMEOUT_MS".to_string(),
                reason: "must be non-zero and shorter than LEASE_REFRESH_SECS".to_string(),
            });
        }

        let reconnect_defaults = ReconnectConfig::default();
        let reconnect = ReconnectConfig {
            initial_delay: env.millis(
                "RECONNECT_INITIAL_DELAY_MS",
                reconnect_defaults.initial_delay,
            )?,
            max_delay: env.secs("RECONNECT_MAX_DELAY_SECS", reconnect_defaults.max_delay)?,
            multiplier: env.parse("RECONNECT_MULTIPLIER", reconnect_defaults.multiplier)?,
            jitter_factor: env.parse("RECONNECT_JITTER", reconnect_defaults.jitter_factor)?,
        };

        let push_defaults = PushSettings::default();
        let push = PushSettings {
            client_buffer: env.parse("CLIENT_BUFFER", push_defaults.client_buffer)?,
            poll_interval: env.secs("CLIENT_POLL_SECS", push_defaults.poll_interval)?,
            push_silence: env.secs("CLIENT_PUSH_SILENCE_SECS", push_defaults.push_silence)?,
        };

        let server = ServerSettings {
            http_port: env.parse("HTTP_PORT", ServerSettings::default().http_port)?,
        };

        Ok(Self {
            instance_id: (env.0)("OWNER_ID")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(default_instance_id),
            default_segment: env.string("DEFAULT_SEGMENT", "NSE"),
            feed,
            store,
            lease,
            reconnect,
            push,
            server,
        })
    }

    /// Worker timing derived from the lease and reconnect settings.
    #[must_use]
    pub fn connector_settings(&self) -> ConnectorSettings {
        ConnectorSettings {
            lease_ttl: self.lease.ttl,
            refresh_interval: self.lease.refresh_interval,
            resubscribe_interval: self.lease.resubscribe_interval,
            connect_timeout: self.lease.connect_timeout,
            reconnect: self.reconnect.clone(),
        }
    }

    /// Contract advertised to push clients.
    #[must_use]
    pub fn client_contract(&self) -> ClientContract {
        ClientContract {
            poll_interval: self.push.poll_interval,
            push_silence: self.push.push_silence,
            bulk_endpoint: "/quotes".to_string(),
        }
    }
}

/// Host name plus a short random suffix, so restarts never reuse an id.
fn default_instance_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "relay".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed or is out of range.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: String,
        /// What was wrong.
        reason: String,
    },
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = (self.0)(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        if value.trim().is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value)
    }

    fn string(&self, key: &str, default: &str) -> String {
        (self.0)(key)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, default).map(Duration::from_millis)
    }
}
