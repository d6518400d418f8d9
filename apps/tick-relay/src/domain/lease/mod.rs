//! Stream Lease Records
//!
//! A lease grants one worker in the fleet the exclusive right to run the
//! upstream connection for a stream key. The record lives in the shared
//! store; this module only defines its shape and lifecycle rules.
//!
//! ```text
//! absent ──► starting ──► running ──► stopping ──► (deleted)
//!               │            │
//!               └────────────┴──── TTL elapses without refresh ──► (deleted)
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::streaming::StreamKey;

/// Lifecycle state stored in a lease record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    /// Acquired; the owner is connecting upstream.
    Starting,
    /// Upstream connection is live and heartbeating.
    Running,
    /// A stop was requested; the owner releases on its next refresh.
    Stopping,
}

impl LeaseState {
    /// Whether the owner is serving the stream rather than winding it down.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// Lowercase name used in logs and responses.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

/// Ownership record for one stream key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamLease {
    /// Stream this lease covers.
    pub stream_key: StreamKey,
    /// Worker holding the lease.
    pub owner_id: String,
    /// Current lifecycle state.
    pub state: LeaseState,
    /// When the lease was first acquired.
    pub started_at: DateTime<Utc>,
    /// Last successful refresh by the owner.
    pub last_heartbeat_at: DateTime<Utc>,
    /// Lifetime of the record without refresh, in seconds.
    pub lease_ttl_secs: u64,
}

impl StreamLease {
    /// A fresh lease in `starting` state.
    #[must_use]
    pub fn starting(
        stream_key: StreamKey,
        owner_id: impl Into<String>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            stream_key,
            owner_id: owner_id.into(),
            state: LeaseState::Starting,
            started_at: now,
            last_heartbeat_at: now,
            lease_ttl_secs: ttl.as_secs().max(1),
        }
    }

    /// Lease TTL as a duration.
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Time since the last refresh, clamped at zero for clock skew.
    #[must_use]
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat_at).to_std().unwrap_or_default()
    }

    /// Whether the owner has missed its refresh window entirely.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.heartbeat_age(now) > self.lease_ttl()
    }

    /// Copy of this lease refreshed at `now`.
    ///
    /// A `starting` lease becomes `running` on its first refresh.
    #[must_use]
    pub fn refreshed(&self, now: DateTime<Utc>) -> Self {
        let state = match self.state {
            LeaseState::Starting => LeaseState::Running,
            other => other,
        };
        Self {
            state,
            last_heartbeat_at: now,
            ..self.clone()
        }
    }

    /// Copy of this lease with a new state.
    #[must_use]
    pub fn with_state(&self, state: LeaseState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Serialize for storage.
    ///
    /// # Errors
    ///
    /// Returns the serializer error; with the derived impls this does not
    /// happen in practice.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a stored record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is not a valid lease document.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(now: DateTime<Utc>) -> StreamLease {
        StreamLease::starting(
            StreamKey::new("swing", ["1", "2"]).unwrap(),
            "worker-a",
            Duration::from_secs(120),
            now,
        )
    }

    #[test]
    fn first_refresh_promotes_to_running() {
        let now = Utc::now();
        let started = lease(now);
        assert_eq!(started.state, LeaseState::Starting);

        let later = now + chrono::Duration::seconds(30);
        let refreshed = started.refreshed(later);
        assert_eq!(refreshed.state, LeaseState::Running);
        assert_eq!(refreshed.last_heartbeat_at, later);
        assert_eq!(refreshed.started_at, now);
    }

    #[test]
    fn refresh_keeps_stopping() {
        let now = Utc::now();
        let stopping = lease(now).with_state(LeaseState::Stopping);
        assert_eq!(stopping.refreshed(now).state, LeaseState::Stopping);
        assert!(!LeaseState::Stopping.is_active());
    }

    #[test]
    fn expiry_is_strictly_after_ttl() {
        let now = Utc::now();
        let l = lease(now);
        assert!(!l.is_expired(now + chrono::Duration::seconds(120)));
        assert!(l.is_expired(now + chrono::Duration::seconds(121)));
    }

    #[test]
    fn heartbeat_age_clamps_negative() {
        let now = Utc::now();
        let l = lease(now);
        assert_eq!(
            l.heartbeat_age(now - chrono::Duration::seconds(5)),
            Duration::ZERO
        );
    }

    #[test]
    fn record_round_trips() {
        let l = lease(Utc::now());
        let raw = l.encode().unwrap();
        assert!(raw.contains("\"owner_id\":\"worker-a\""));
        assert!(raw.contains("\"state\":\"starting\""));
        assert_eq!(StreamLease::decode(&raw).unwrap(), l);
    }
}
