//! Lease Health Monitor
//!
//! Periodic sweep over all lease records. A `running` lease whose last
//! heartbeat is older than its TTL belongs to an owner that died without
//! releasing; it is force-released with compare-and-delete so a refresh
//! racing the sweep wins.
//!
//! The store's own key expiry normally removes such leases first. The sweep
//! covers records whose store TTL outlived the heartbeat, and produces the
//! aggregate counts used by `/streams` and the lease gauges.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{RegistryError, StreamRegistry};
use crate::domain::lease::LeaseState;
use crate::domain::streaming::StreamKey;
use crate::infrastructure::metrics;

/// Default sweep period.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Health of one stream as seen from its lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamHealthStatus {
    /// Heartbeat is recent.
    Healthy,
    /// Heartbeat is older than two refresh intervals. Advisory only.
    Stale,
    /// No lease, or the lease is being stopped.
    NotRunning,
}

/// Per-stream health view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamHealth {
    /// Derived status.
    pub status: StreamHealthStatus,
    /// Seconds since the last heartbeat, if a lease exists.
    pub heartbeat_age_seconds: Option<u64>,
    /// Lease owner, if a lease exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// Lease state, if a lease exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<LeaseState>,
}

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Leases in `starting` or `running` with a live heartbeat.
    pub active: usize,
    /// Leases in `stopping`.
    pub stopping: usize,
    /// Running leases found past their TTL.
    pub stale: usize,
    /// Stale leases actually deleted by this sweep.
    pub released: usize,
    /// When the sweep ran.
    pub checked_at: Option<DateTime<Utc>>,
}

/// Sweeps leases and answers per-stream health queries.
#[derive(Debug)]
pub struct HealthMonitor {
    registry: StreamRegistry,
    refresh_interval: Duration,
    sweep_interval: Duration,
    last_report: RwLock<Option<SweepReport>>,
}

impl HealthMonitor {
    /// Create a monitor. `refresh_interval` is the owners' heartbeat
    /// period and sets the advisory staleness threshold.
    #[must_use]
    pub fn new(
        registry: StreamRegistry,
        refresh_interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            registry,
            refresh_interval,
            sweep_interval,
            last_report: RwLock::new(None),
        }
    }

    /// Result of the most recent sweep.
    #[must_use]
    pub fn last_report(&self) -> Option<SweepReport> {
        self.last_report.read().clone()
    }

    /// Sweep now.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if the store cannot be read.
    pub async fn sweep(&self) -> Result<SweepReport, RegistryError> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as of `now`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if the store cannot be read or written.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, RegistryError> {
        let mut report = SweepReport {
            checked_at: Some(now),
            ..SweepReport::default()
        };

        for record in self.registry.leases().await? {
            let lease = &record.lease;
            match lease.state {
                LeaseState::Running if lease.is_expired(now) => {
                    report.stale += 1;
                    let age = lease.heartbeat_age(now).as_secs();
                    if self
                        .registry
                        .force_release(&lease.stream_key, &record.raw)
                        .await?
                    {
                        report.released += 1;
                        warn!(
                            stream_key = %lease.stream_key,
                            owner_id = %lease.owner_id,
                            heartbeat_age_secs = age,
                            "Reclaimed expired lease"
                        );
                    } else {
                        debug!(stream_key = %lease.stream_key, "Expired lease changed before reclaim");
                    }
                }
                state if state.is_active() => report.active += 1,
                _ => report.stopping += 1,
            }
        }

        metrics::set_lease_counts(report.active, report.stale);
        metrics::record_leases_reclaimed(report.released as u64);
        *self.last_report.write() = Some(report.clone());
        Ok(report)
    }

    /// Health of one stream.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if the store cannot be read.
    pub async fn stream_health(&self, stream_key: &StreamKey) -> Result<StreamHealth, RegistryError> {
        let Some(lease) = self.registry.status(stream_key).await? else {
            return Ok(StreamHealth {
                status: StreamHealthStatus::NotRunning,
                heartbeat_age_seconds: None,
                owner_id: None,
                state: None,
            });
        };

        let age = lease.heartbeat_age(Utc::now());
        let status = if !lease.state.is_active() {
            StreamHealthStatus::NotRunning
        } else if age > self.refresh_interval * 2 {
            StreamHealthStatus::Stale
        } else {
            StreamHealthStatus::Healthy
        };

        Ok(StreamHealth {
            status,
            heartbeat_age_seconds: Some(age.as_secs()),
            owner_id: Some(lease.owner_id),
            state: Some(lease.state),
        })
    }

    /// Sweep on a fixed period until cancelled. Failures are logged and the
    /// next period retries.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.sweep_interval.as_secs(), "Lease health monitor started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.sweep().await {
                Ok(report) => info!(
                    active = report.active,
                    stopping = report.stopping,
                    stale = report.stale,
                    released = report.released,
                    "Lease sweep complete"
                ),
                Err(e) => warn!(error = %e, "Lease sweep failed"),
            }
        }
        info!("Lease health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::application::ports::KeyValueStore;
    use crate::domain::lease::StreamLease;
    use crate::infrastructure::store::MemoryStore;

    fn key(id: &str) -> StreamKey {
        StreamKey::new("swing", [id]).unwrap()
    }

    /// Writes a lease whose store TTL outlives its heartbeat window.
    async fn plant(store: &MemoryStore, lease: &StreamLease) {
        store
            .set(
                &lease.stream_key.lease_key(),
                &lease.encode().unwrap(),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();
    }

    fn monitor(store: &Arc<MemoryStore>) -> HealthMonitor {
        HealthMonitor::new(
            StreamRegistry::new(store.clone()),
            Duration::from_secs(30),
            DEFAULT_SWEEP_INTERVAL,
        )
    }

    #[tokio::test]
    async fn sweep_reclaims_only_expired_running_leases() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let ttl = Duration::from_secs(120);
        let old = now - chrono::Duration::seconds(300);

        let dead = StreamLease::starting(key("1"), "w1", ttl, old).refreshed(old);
        let alive = StreamLease::starting(key("2"), "w2", ttl, now).refreshed(now);
        let fresh_start = StreamLease::starting(key("3"), "w3", ttl, old);
        plant(&store, &dead).await;
        plant(&store, &alive).await;
        plant(&store, &fresh_start).await;

        let report = monitor(&store).sweep_at(now).await.unwrap();

        assert_eq!(report.stale, 1);
        assert_eq!(report.released, 1);
        assert_eq!(report.active, 2);
        let registry = StreamRegistry::new(store.clone());
        assert!(registry.status(&key("1")).await.unwrap().is_none());
        assert!(registry.status(&key("2")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_counts_stopping_apart_from_active() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let ttl = Duration::from_secs(120);
        let starting = StreamLease::starting(key("1"), "w1", ttl, now);
        let running = StreamLease::starting(key("2"), "w2", ttl, now).refreshed(now);
        let stopping = StreamLease {
            stream_key: key("3"),
            ..running.with_state(LeaseState::Stopping)
        };
        plant(&store, &starting).await;
        plant(&store, &running).await;
        plant(&store, &stopping).await;

        let report = monitor(&store).sweep_at(now).await.unwrap();

        assert_eq!(report.active, 2);
        assert_eq!(report.stopping, 1);
        assert_eq!(report.stale, 0);
    }

    #[tokio::test]
    async fn lease_within_ttl_never_reclaimed() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let ttl = Duration::from_secs(120);
        let lease = StreamLease::starting(key("1"), "w1", ttl, now).refreshed(now);
        plant(&store, &lease).await;

        let report = monitor(&store)
            .sweep_at(now + chrono::Duration::seconds(120))
            .await
            .unwrap();

        assert_eq!(report.released, 0);
        assert_eq!(report.active, 1);
    }

    #[tokio::test]
    async fn stream_health_statuses() {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor(&store);
        let now = Utc::now();
        let ttl = Duration::from_secs(120);

        let missing = monitor.stream_health(&key("9")).await.unwrap();
        assert_eq!(missing.status, StreamHealthStatus::NotRunning);
        assert_eq!(missing.heartbeat_age_seconds, None);

        let healthy = StreamLease::starting(key("1"), "w1", ttl, now).refreshed(now);
        plant(&store, &healthy).await;
        assert_eq!(
            monitor.stream_health(&key("1")).await.unwrap().status,
            StreamHealthStatus::Healthy
        );

        let old = now - chrono::Duration::seconds(90);
        let stale = StreamLease::starting(key("2"), "w2", ttl, old).refreshed(old);
        plant(&store, &stale).await;
        let health = monitor.stream_health(&key("2")).await.unwrap();
        assert_eq!(health.status, StreamHealthStatus::Stale);
        assert!(health.heartbeat_age_seconds.unwrap() >= 90);

        let stopping = healthy.with_state(LeaseState::Stopping);
        plant(&store, &stopping).await;
        assert_eq!(
            monitor.stream_health(&key("1")).await.unwrap().status,
            StreamHealthStatus::NotRunning
        );
    }

    #[tokio::test]
    async fn last_report_kept() {
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor(&store);
        assert!(monitor.last_report().is_none());

        monitor.sweep().await.unwrap();

        let report = monitor.last_report().unwrap();
        assert_eq!(report.active, 0);
        assert!(report.checked_at.is_some());
    }
}
