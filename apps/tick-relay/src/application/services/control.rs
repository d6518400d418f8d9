//! Start/Stop Control Surface
//!
//! Turns start and stop requests into lease operations and local workers.
//!
//! # State machine (per stream key)
//!
//! ```text
//! absent ──start──► starting ──first refresh──► running ──stop──► stopping ──release──► absent
//!                      │                           │
//!                      └── start again ──► already_running (idempotent)
//! ```
//!
//! The lease in the shared store is the source of truth. The map of local
//! workers only remembers which leases this process currently runs. A stop
//! always marks the lease `stopping` first; a local worker is then cancelled
//! directly rather than waiting for its next refresh.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::connector::{StreamContext, UpstreamFeedConnector};
use super::registry::{AcquireOutcome, RegistryError, StreamRegistry};
use crate::application::ports::{FeedSession, TransportError};
use crate::domain::streaming::{InstrumentKey, KeyError, StreamKey, canonical_segment};
use crate::infrastructure::metrics;

/// How long a local stop waits for the worker to release its lease.
const STOP_WAIT: Duration = Duration::from_secs(10);

// =============================================================================
// Requests and Responses
// =============================================================================

/// Request to start streaming an instrument set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    /// Subscription type tag, part of the stream key.
    pub subscription_type: String,
    /// Instruments as `SEG:ID` or bare ids.
    #[serde(default)]
    pub instrument_keys: Vec<String>,
    /// Optional display symbols keyed like `instrument_keys`.
    #[serde(default)]
    pub symbols: HashMap<String, String>,
    /// Reply immediately and connect in the background.
    #[serde(default)]
    pub background: bool,
}

/// Outcome of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    /// Lease acquired and upstream connected.
    Started,
    /// Another worker holds the lease.
    AlreadyRunning,
    /// Lease acquired; connecting in the background.
    Queued,
}

/// Response to a start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartResponse {
    /// Outcome.
    pub status: StartStatus,
    /// Canonical stream key.
    pub stream_key: String,
    /// Owner of the lease, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
}

/// Request to stop a stream.
#[derive(Debug, Clone, Deserialize)]
pub struct StopRequest {
    /// Stream key as returned by start.
    pub stream_key: String,
}

/// Outcome of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    /// Stopped here, or the owner was asked to stop.
    Stopped,
    /// No lease existed.
    NotRunning,
}

/// Response to a stop request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopResponse {
    /// Outcome.
    pub status: StopStatus,
    /// Canonical stream key.
    pub stream_key: String,
}

/// Request to change the instruments of a running stream.
#[derive(Debug, Clone, Deserialize)]
pub struct InterestRequest {
    /// Stream key as returned by start.
    pub stream_key: String,
    /// New instrument set.
    #[serde(default)]
    pub instrument_keys: Vec<String>,
}

/// Errors surfaced by the control surface.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Request is missing fields or contains malformed keys.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Upstream could not be connected.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[from] TransportError),
    /// Shared store could not be reached.
    #[error("temporarily unavailable: {0}")]
    TemporarilyUnavailable(#[from] RegistryError),
}

impl From<KeyError> for ControlError {
    fn from(e: KeyError) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

// =============================================================================
// Controller
// =============================================================================

struct LocalStream {
    owner_id: String,
    cancel: CancellationToken,
    interest: watch::Sender<Vec<InstrumentKey>>,
    handle: JoinHandle<()>,
}

/// Starts, stops and tracks upstream workers of this process.
pub struct StreamController {
    registry: StreamRegistry,
    connector: Arc<UpstreamFeedConnector>,
    instance_id: String,
    default_segment: String,
    local: Arc<Mutex<HashMap<StreamKey, LocalStream>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for StreamController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamController")
            .field("instance_id", &self.instance_id)
            .field("local_streams", &self.local.lock().len())
            .finish_non_exhaustive()
    }
}

impl StreamController {
    /// Create a controller. `instance_id` prefixes every lease owner id
    /// issued by this process.
    #[must_use]
    pub fn new(
        registry: StreamRegistry,
        connector: Arc<UpstreamFeedConnector>,
        instance_id: impl Into<String>,
        default_segment: impl Into<String>,
    ) -> Self {
        let default_segment: String = default_segment.into();
        Self {
            registry,
            connector,
            instance_id: instance_id.into(),
            default_segment: canonical_segment(&default_segment),
            local: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Segment used for bare instrument ids.
    #[must_use]
    pub fn default_segment(&self) -> &str {
        &self.default_segment
    }

    /// Parse instrument keys, rejecting an empty list.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InvalidRequest` for missing or malformed keys.
    pub fn parse_instruments(&self, raw: &[String]) -> Result<Vec<InstrumentKey>, ControlError> {
        if raw.is_empty() {
            return Err(ControlError::InvalidRequest(
                "instrument_keys must not be empty".to_string(),
            ));
        }
        let keys: BTreeSet<_> = raw
            .iter()
            .map(|k| InstrumentKey::parse(k, &self.default_segment))
            .collect::<Result<_, _>>()?;
        Ok(keys.into_iter().collect())
    }

    /// Canonical stream key for a subscription type and instrument set.
    ///
    /// Instruments in the default segment contribute their bare id, so
    /// `1`, `NSE:1` and `NSE_EQ:1` name the same stream.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InvalidRequest` for an empty type or set.
    pub fn stream_key_for(
        &self,
        subscription_type: &str,
        instruments: &[InstrumentKey],
    ) -> Result<StreamKey, ControlError> {
        let ids = instruments.iter().map(|k| {
            if k.segment() == self.default_segment {
                k.security_id().to_string()
            } else {
                k.to_string()
            }
        });
        Ok(StreamKey::new(subscription_type, ids)?)
    }

    /// Start a stream, or report who already runs it.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` for missing or malformed fields
    /// - `TemporarilyUnavailable` if the store cannot be reached
    /// - `UpstreamUnavailable` if a synchronous start cannot connect; the
    ///   lease is released again
    pub async fn start(&self, request: StartRequest) -> Result<StartResponse, ControlError> {
        let instruments = self.parse_instruments(&request.instrument_keys)?;
        let stream_key = self.stream_key_for(&request.subscription_type, &instruments)?;
        let symbols = request
            .symbols
            .iter()
            .map(|(k, symbol)| {
                InstrumentKey::parse(k, &self.default_segment).map(|k| (k, symbol.clone()))
            })
            .collect::<Result<HashMap<_, _>, _>>()?;

        let owner_id = format!("{}:{}", self.instance_id, Uuid::new_v4().simple());
        let ttl = self.connector.settings().lease_ttl;

        let acquired = self.registry.try_acquire(&stream_key, &owner_id, ttl).await;
        match acquired {
            Ok(AcquireOutcome::Granted(_)) => metrics::record_lease_acquisition("granted"),
            Ok(AcquireOutcome::AlreadyHeld { current_owner, state }) => {
                metrics::record_lease_acquisition("already_held");
                info!(stream_key = %stream_key, owner = %current_owner, state = state.as_str(), "Stream already running");
                return Ok(StartResponse {
                    status: StartStatus::AlreadyRunning,
                    stream_key: stream_key.to_string(),
                    lease_owner: Some(current_owner),
                });
            }
            Err(e) => {
                metrics::record_lease_acquisition("error");
                return Err(e.into());
            }
        }

        if request.background {
            self.spawn_worker(stream_key.clone(), owner_id.clone(), instruments, symbols, None);
            info!(stream_key = %stream_key, owner_id = %owner_id, "Stream queued");
            return Ok(StartResponse {
                status: StartStatus::Queued,
                stream_key: stream_key.to_string(),
                lease_owner: Some(owner_id),
            });
        }

        match self.connector.open(&instruments).await {
            Ok(session) => {
                self.spawn_worker(
                    stream_key.clone(),
                    owner_id.clone(),
                    instruments,
                    symbols,
                    Some(session),
                );
                info!(stream_key = %stream_key, owner_id = %owner_id, "Stream started");
                Ok(StartResponse {
                    status: StartStatus::Started,
                    stream_key: stream_key.to_string(),
                    lease_owner: Some(owner_id),
                })
            }
            Err(e) => {
                warn!(stream_key = %stream_key, error = %e, "Upstream connect failed, releasing lease");
                if let Err(release) = self.registry.release(&stream_key, &owner_id).await {
                    warn!(stream_key = %stream_key, error = %release, "Lease release failed; it will expire by TTL");
                }
                Err(ControlError::UpstreamUnavailable(e))
            }
        }
    }

    /// Stop a stream.
    ///
    /// The lease is marked `stopping`. A worker owned by this process is
    /// then cancelled and awaited; a remote owner observes the mark on its
    /// next refresh.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` for a malformed stream key
    /// - `TemporarilyUnavailable` if the store cannot be reached
    pub async fn stop(&self, raw_key: &str) -> Result<StopResponse, ControlError> {
        let stream_key: StreamKey = raw_key.parse()?;

        let local = self.local.lock().remove(&stream_key);
        if let Some(worker) = local {
            metrics::set_local_streams(self.local.lock().len());
            if let Err(e) = self.registry.request_stop(&stream_key).await {
                warn!(stream_key = %stream_key, error = %e, "Could not mark lease stopping; cancelling worker anyway");
            }
            worker.cancel.cancel();
            if tokio::time::timeout(STOP_WAIT, worker.handle).await.is_err() {
                warn!(stream_key = %stream_key, "Worker did not finish in time");
            }
            info!(stream_key = %stream_key, owner_id = %worker.owner_id, "Stream stopped");
            return Ok(StopResponse {
                status: StopStatus::Stopped,
                stream_key: stream_key.to_string(),
            });
        }

        let status = match self.registry.request_stop(&stream_key).await? {
            Some(lease) => {
                info!(stream_key = %stream_key, owner = %lease.owner_id, "Stop requested from remote owner");
                StopStatus::Stopped
            }
            None => StopStatus::NotRunning,
        };
        Ok(StopResponse {
            status,
            stream_key: stream_key.to_string(),
        })
    }

    /// Hand a new instrument set to a local worker. It is applied on the
    /// worker's next resubscribe tick. Returns whether a local worker
    /// accepted it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for malformed keys.
    pub fn update_interest(&self, raw_key: &str, raw_instruments: &[String]) -> Result<bool, ControlError> {
        let stream_key: StreamKey = raw_key.parse()?;
        let instruments = self.parse_instruments(raw_instruments)?;
        let local = self.local.lock();
        let Some(worker) = local.get(&stream_key) else {
            return Ok(false);
        };
        worker.interest.send_replace(instruments);
        Ok(true)
    }

    /// Stream keys with a worker in this process.
    #[must_use]
    pub fn local_streams(&self) -> Vec<StreamKey> {
        let mut keys: Vec<_> = self.local.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Cancel every local worker and wait for their leases to be released.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers: Vec<_> = self.local.lock().drain().collect();
        metrics::set_local_streams(0);
        for (stream_key, worker) in workers {
            if tokio::time::timeout(STOP_WAIT, worker.handle).await.is_err() {
                warn!(stream_key = %stream_key, "Worker did not finish before shutdown");
            }
        }
    }

    fn spawn_worker(
        &self,
        stream_key: StreamKey,
        owner_id: String,
        instruments: Vec<InstrumentKey>,
        symbols: HashMap<InstrumentKey, String>,
        session: Option<Box<dyn FeedSession>>,
    ) {
        let cancel = self.shutdown.child_token();
        let (interest_tx, interest_rx) = watch::channel(instruments);
        let ctx = StreamContext {
            stream_key: stream_key.clone(),
            owner_id: owner_id.clone(),
            symbols,
            interest: interest_rx,
            cancel: cancel.clone(),
        };

        let connector = Arc::clone(&self.connector);
        let local = Arc::clone(&self.local);
        let worker_key = stream_key.clone();
        let worker_owner = owner_id.clone();

        // Hold the lock across spawn so the worker cannot deregister first.
        let mut map = self.local.lock();
        let handle = tokio::spawn(async move {
            // Outcome is logged and counted by the connector.
            let _ = connector.run(ctx, session).await;
            let mut map = local.lock();
            if map
                .get(&worker_key)
                .is_some_and(|w| w.owner_id == worker_owner)
            {
                map.remove(&worker_key);
            }
            metrics::set_local_streams(map.len());
        });
        map.insert(
            stream_key,
            LocalStream {
                owner_id,
                cancel,
                interest: interest_tx,
                handle,
            },
        );
        metrics::set_local_streams(map.len());
    }
}

// =============================================================================
// Tests
// =============================================================================
