//! Upstream Feed Connector
//!
//! Owns the single physical upstream connection for one stream key while
//! its lease is held.
//!
//! # Worker loop
//!
//! ```text
//!            ┌────────── refresh timer ──► registry.refresh ──► Lost / StopRequested ──► exit
//!            │
//! session ───┼────────── resubscribe timer ──► apply interest diff, re-send subscription
//!            │
//!            └────────── next_tick ──► cache.put ──► broadcaster.publish
//!                           │
//!                           └─ closed / error ──► reconnect (backoff, capped by lease TTL)
//! ```
//!
//! The only externally visible effects are cache writes and broadcast
//! publications. Refresh runs on its own timer so a quiet instrument set
//! still keeps the lease alive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::broadcaster::TickBroadcaster;
use super::cache::TickCache;
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::registry::{RefreshOutcome, RegistryError, StreamRegistry};
use crate::application::ports::{
    FeedSession, StoreError, TransportError, UpstreamTick, UpstreamTransport,
};
use crate::domain::streaming::{InstrumentKey, StreamKey, TickEvent, TickSource};
use crate::domain::subscription::InterestChanges;
use crate::infrastructure::metrics;

// =============================================================================
// Settings and Outcomes
// =============================================================================

/// Timing parameters for upstream workers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorSettings {
    /// Lease lifetime without refresh.
    pub lease_ttl: Duration,
    /// Interval between lease refreshes.
    pub refresh_interval: Duration,
    /// Interval between subscription re-sends.
    pub resubscribe_interval: Duration,
    /// Bound on connect plus initial subscribe.
    pub connect_timeout: Duration,
    /// Backoff between reconnect attempts.
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(120),
            refresh_interval: Duration::from_secs(30),
            resubscribe_interval: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Why a worker terminated normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
    /// Cancelled by the local controller or process shutdown.
    Stopped,
    /// Another owner holds the lease, or it expired.
    LeaseLost,
    /// A stop was requested through the lease record.
    StopRequested,
    /// The upstream could not be reached before the lease would expire.
    ReconnectExhausted,
}

impl StreamExit {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::LeaseLost => "lease_lost",
            Self::StopRequested => "stop_requested",
            Self::ReconnectExhausted => "reconnect_exhausted",
        }
    }

    /// Whether the worker still owns the lease and must release it.
    const fn holds_lease(self) -> bool {
        !matches!(self, Self::LeaseLost)
    }
}

/// Storage failures that end a worker.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Cache write or publish failed.
    #[error("shared store failed: {0}")]
    Store(#[from] StoreError),
    /// Lease refresh failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Everything one worker needs besides the shared connector.
#[derive(Debug)]
pub struct StreamContext {
    /// Stream this worker owns.
    pub stream_key: StreamKey,
    /// Lease owner identity of this worker.
    pub owner_id: String,
    /// Display symbols by instrument.
    pub symbols: HashMap<InstrumentKey, String>,
    /// Desired instrument set; applied on the resubscribe timer.
    pub interest: watch::Receiver<Vec<InstrumentKey>>,
    /// Cooperative stop signal.
    pub cancel: CancellationToken,
}

enum Reconnect {
    Connected(Box<dyn FeedSession>),
    Exit(StreamExit),
}

enum Event {
    Cancelled,
    Refresh,
    Resubscribe,
    Tick(Result<Option<UpstreamTick>, TransportError>),
}

// =============================================================================
// Connector
// =============================================================================

/// Runs upstream workers. Shared by all workers of a process.
pub struct UpstreamFeedConnector {
    registry: StreamRegistry,
    cache: TickCache,
    broadcaster: TickBroadcaster,
    transport: Arc<dyn UpstreamTransport>,
    settings: ConnectorSettings,
}

impl std::fmt::Debug for UpstreamFeedConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamFeedConnector")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl UpstreamFeedConnector {
    /// Create a connector.
    #[must_use]
    pub fn new(
        registry: StreamRegistry,
        cache: TickCache,
        broadcaster: TickBroadcaster,
        transport: Arc<dyn UpstreamTransport>,
        settings: ConnectorSettings,
    ) -> Self {
        Self {
            registry,
            cache,
            broadcaster,
            transport,
            settings,
        }
    }

    /// Worker timing parameters.
    #[must_use]
    pub const fn settings(&self) -> &ConnectorSettings {
        &self.settings
    }

    /// Connect and subscribe, bounded by the connect timeout.
    ///
    /// # Errors
    ///
    /// Returns the transport error, or `TransportError::Timeout`.
    pub async fn open(
        &self,
        instruments: &[InstrumentKey],
    ) -> Result<Box<dyn FeedSession>, TransportError> {
        let attempt = async {
            let mut session = self.transport.connect().await?;
            if let Err(e) = session.subscribe(instruments).await {
                session.close().await;
                return Err(e);
            }
            Ok(session)
        };
        tokio::time::timeout(self.settings.connect_timeout, attempt)
            .await
            .map_err(|_| TransportError::Timeout(self.settings.connect_timeout))?
    }

    /// Run a worker until it stops, loses its lease or the store fails.
    ///
    /// `session` is an already open connection; with `None` the worker
    /// connects itself. On every exit except `LeaseLost` the lease is
    /// released.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError` if the shared store fails; the lease is
    /// released on a best-effort basis first.
    pub async fn run(
        &self,
        mut ctx: StreamContext,
        mut session: Option<Box<dyn FeedSession>>,
    ) -> Result<StreamExit, ConnectorError> {
        let mut subscribed = ctx.interest.borrow_and_update().clone();
        let mut policy = ReconnectPolicy::new(self.settings.reconnect.clone());
        let mut last_refresh = Instant::now();

        let refresh_every = self.settings.refresh_interval;
        let resubscribe_every = self.settings.resubscribe_interval;
        let mut refresh_timer = interval_at(Instant::now() + refresh_every, refresh_every);
        refresh_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resubscribe_timer =
            interval_at(Instant::now() + resubscribe_every, resubscribe_every);
        resubscribe_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            stream_key = %ctx.stream_key,
            owner_id = %ctx.owner_id,
            instruments = subscribed.len(),
            "Upstream worker started"
        );

        // Every fresh session confirms the lease at once: a handed-in session
        // moves it out of `starting`, and an outage may have used up most of it.
        let mut confirm_lease = true;
        let outcome = loop {
            if session.is_none() {
                subscribed = ctx.interest.borrow_and_update().clone();
                match self
                    .reconnect(&ctx, &subscribed, &mut policy, last_refresh)
                    .await
                {
                    Reconnect::Connected(live) => session = Some(live),
                    Reconnect::Exit(exit) => break Ok(exit),
                }
                confirm_lease = true;
            }
            if confirm_lease {
                confirm_lease = false;
                match self.heartbeat(&ctx).await {
                    Ok(None) => {
                        last_refresh = Instant::now();
                        refresh_timer.reset();
                    }
                    Ok(Some(exit)) => break Ok(exit),
                    Err(e) => break Err(e),
                }
            }
            let Some(live) = session.as_mut() else {
                continue;
            };

            let event = tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => Event::Cancelled,
                _ = refresh_timer.tick() => Event::Refresh,
                _ = resubscribe_timer.tick() => Event::Resubscribe,
                tick = live.next_tick() => Event::Tick(tick),
            };

            match event {
                Event::Cancelled => break Ok(StreamExit::Stopped),
                Event::Refresh => match self.heartbeat(&ctx).await {
                    Ok(None) => last_refresh = Instant::now(),
                    Ok(Some(exit)) => break Ok(exit),
                    Err(e) => break Err(e),
                },
                Event::Resubscribe => {
                    let desired = ctx.interest.borrow_and_update().clone();
                    if let Some(live) = session.as_mut()
                        && let Err(e) = resubscribe(&mut **live, &subscribed, &desired).await
                    {
                        warn!(stream_key = %ctx.stream_key, error = %e, "Resubscribe failed, reconnecting");
                        drop_session(&mut session).await;
                    }
                    subscribed = desired;
                }
                Event::Tick(Ok(Some(tick))) => {
                    if let Err(e) = self.process_tick(&ctx, tick).await {
                        break Err(e.into());
                    }
                }
                Event::Tick(Ok(None)) => {
                    warn!(stream_key = %ctx.stream_key, "Upstream closed the connection, reconnecting");
                    drop_session(&mut session).await;
                }
                Event::Tick(Err(e)) => {
                    warn!(stream_key = %ctx.stream_key, error = %e, "Upstream connection failed, reconnecting");
                    drop_session(&mut session).await;
                }
            }
        };

        if let Some(mut live) = session.take() {
            live.close().await;
        }
        self.finish(&ctx, &outcome).await;
        outcome
    }

    /// Reconnect with backoff until connected, cancelled, or the lease
    /// window measured from the last successful refresh is used up.
    async fn reconnect(
        &self,
        ctx: &StreamContext,
        instruments: &[InstrumentKey],
        policy: &mut ReconnectPolicy,
        last_refresh: Instant,
    ) -> Reconnect {
        let deadline = last_refresh + self.settings.lease_ttl;

        loop {
            if Instant::now() >= deadline {
                warn!(stream_key = %ctx.stream_key, attempts = policy.attempt_count(), "Reconnect window exhausted");
                return Reconnect::Exit(StreamExit::ReconnectExhausted);
            }

            let attempt = tokio::select! {
                () = ctx.cancel.cancelled() => return Reconnect::Exit(StreamExit::Stopped),
                attempt = self.open(instruments) => attempt,
            };

            let error = match attempt {
                Ok(live) => {
                    if policy.attempt_count() > 0 {
                        info!(stream_key = %ctx.stream_key, attempts = policy.attempt_count(), "Upstream reconnected");
                    }
                    policy.reset();
                    return Reconnect::Connected(live);
                }
                Err(e) => e,
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(delay) = policy.next_delay(remaining) else {
                warn!(stream_key = %ctx.stream_key, error = %error, "Reconnect window exhausted");
                return Reconnect::Exit(StreamExit::ReconnectExhausted);
            };
            metrics::record_reconnect();
            warn!(
                stream_key = %ctx.stream_key,
                error = %error,
                attempt = policy.attempt_count(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Upstream connect failed, backing off"
            );

            tokio::select! {
                () = ctx.cancel.cancelled() => return Reconnect::Exit(StreamExit::Stopped),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Refresh the lease. `Some(exit)` means the worker must stop.
    async fn heartbeat(&self, ctx: &StreamContext) -> Result<Option<StreamExit>, ConnectorError> {
        match self.registry.refresh(&ctx.stream_key, &ctx.owner_id).await? {
            RefreshOutcome::Refreshed(lease) => {
                debug!(stream_key = %ctx.stream_key, state = lease.state.as_str(), "Lease refreshed");
                Ok(None)
            }
            RefreshOutcome::Lost => Ok(Some(StreamExit::LeaseLost)),
            RefreshOutcome::StopRequested => Ok(Some(StreamExit::StopRequested)),
        }
    }

    async fn process_tick(&self, ctx: &StreamContext, tick: UpstreamTick) -> Result<(), StoreError> {
        let started = std::time::Instant::now();

        self.cache.put(&tick.instrument, tick.price).await?;

        let symbol = ctx
            .symbols
            .get(&tick.instrument)
            .cloned()
            .unwrap_or_else(|| tick.instrument.security_id().to_string());
        let event = TickEvent {
            instrument_key: tick.instrument,
            symbol,
            price: tick.price,
            timestamp: tick.traded_at.unwrap_or_else(Utc::now),
            source: TickSource::Websocket,
        };
        self.broadcaster.publish(&event).await?;

        metrics::record_tick_processed(started.elapsed());
        metrics::record_ticks_published("websocket", 1);
        trace!(instrument = %event.instrument_key, price = %event.price, "Tick relayed");
        Ok(())
    }

    async fn finish(&self, ctx: &StreamContext, outcome: &Result<StreamExit, ConnectorError>) {
        let release = match outcome {
            Ok(exit) => exit.holds_lease(),
            Err(_) => true,
        };
        if release
            && let Err(e) = self.registry.release(&ctx.stream_key, &ctx.owner_id).await
        {
            warn!(stream_key = %ctx.stream_key, error = %e, "Lease release failed; it will expire by TTL");
        }

        match outcome {
            Ok(exit) => {
                info!(
                    stream_key = %ctx.stream_key,
                    owner_id = %ctx.owner_id,
                    reason = exit.as_str(),
                    "Upstream worker exited"
                );
                metrics::record_stream_exit(exit.as_str());
            }
            Err(e) => {
                error!(
                    stream_key = %ctx.stream_key,
                    owner_id = %ctx.owner_id,
                    error = %e,
                    "Upstream worker failed"
                );
                metrics::record_stream_exit("store_error");
            }
        }
    }
}

/// Apply the interest diff, then re-send the full set.
async fn resubscribe(
    session: &mut dyn FeedSession,
    current: &[InstrumentKey],
    desired: &[InstrumentKey],
) -> Result<(), TransportError> {
    let changes = InterestChanges::between(current.iter(), desired.iter());
    if !changes.removed.is_empty() {
        let removed: Vec<_> = changes.removed.into_iter().collect();
        session.unsubscribe(&removed).await?;
    }
    if !desired.is_empty() {
        session.subscribe(desired).await?;
    }
    debug!(
        added = changes.added.len(),
        instruments = desired.len(),
        "Subscription re-sent"
    );
    Ok(())
}

async fn drop_session(session: &mut Option<Box<dyn FeedSession>>) {
    if let Some(mut live) = session.take() {
        live.close().await;
    }
    metrics::record_session_dropped();
}

// =============================================================================
// Tests
// =============================================================================
