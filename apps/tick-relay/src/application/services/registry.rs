//! Stream Registry (Lease Manager)
//!
//! Atomic create/refresh/release over lease records in the shared store,
//! giving at most one active owner per stream key across the fleet.
//!
//! # Atomicity
//!
//! - Acquire is a single create-if-absent with TTL.
//! - Refresh, release and stop requests read the record, check it, and
//!   write back with compare-and-swap (or compare-and-delete) against the
//!   exact bytes read. If anything changed in between the write fails and
//!   the operation re-reads, so a former owner can never resurrect or
//!   delete a lease that was reclaimed by someone else.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::application::ports::{DEFAULT_STORE_TIMEOUT, KeyValueStore, StoreError, bounded};
use crate::domain::lease::{LeaseState, StreamLease};
use crate::domain::streaming::{LEASE_KEY_PREFIX, StreamKey};

/// Retries of a read-check-write cycle that lost a race.
const CAS_ATTEMPTS: usize = 3;

// =============================================================================
// Outcomes and Errors
// =============================================================================

/// Result of an acquisition attempt. Contention is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller now owns the lease.
    Granted(StreamLease),
    /// Another worker holds an unexpired lease.
    AlreadyHeld {
        /// Current owner.
        current_owner: String,
        /// Current lease state.
        state: LeaseState,
    },
}

/// Result of a refresh by the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Heartbeat recorded; the returned lease is what is now stored.
    Refreshed(StreamLease),
    /// The caller no longer owns the lease.
    Lost,
    /// The caller still owns the lease but a stop was requested.
    StopRequested,
}

impl RefreshOutcome {
    /// Whether the refresh succeeded.
    #[must_use]
    pub const fn is_refreshed(&self) -> bool {
        matches!(self, Self::Refreshed(_))
    }
}

/// A stored lease with the exact raw value it was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Decoded lease.
    pub lease: StreamLease,
    /// Raw stored value, for compare-and-delete.
    pub raw: String,
}

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Shared store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A lease record could not be encoded or decoded.
    #[error("corrupt lease record at {key}: {source}")]
    Corrupt {
        /// Store key of the record.
        key: String,
        /// Decoder error.
        source: serde_json::Error,
    },
    /// The record kept changing underneath a conditional write.
    #[error("lease {0} changed concurrently; gave up after retries")]
    Contended(String),
}

// =============================================================================
// Registry
// =============================================================================

/// Lease operations over the shared store.
#[derive(Clone)]
pub struct StreamRegistry {
    store: Arc<dyn KeyValueStore>,
    timeout: Duration,
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl StreamRegistry {
    /// Create a registry over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Bound every store round trip by `timeout`, so a silent store
    /// surfaces as `StoreError::Timeout` instead of a stuck caller.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Try to become the owner of `stream_key`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` on store failure; losing the race is
    /// `AcquireOutcome::AlreadyHeld`.
    pub async fn try_acquire(
        &self,
        stream_key: &StreamKey,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<AcquireOutcome, RegistryError> {
        let key = stream_key.lease_key();
        let lease = StreamLease::starting(stream_key.clone(), owner_id, ttl, Utc::now());
        let raw = encode(&key, &lease)?;

        for _ in 0..CAS_ATTEMPTS {
            if bounded(self.timeout, self.store.set_if_absent(&key, &raw, lease.lease_ttl())).await? {
                debug!(stream_key = %stream_key, owner_id, "Lease granted");
                return Ok(AcquireOutcome::Granted(lease));
            }
            // The holder may have expired between the two calls; retry then.
            if let Some(current) = self.read(&key).await? {
                return Ok(AcquireOutcome::AlreadyHeld {
                    current_owner: current.lease.owner_id,
                    state: current.lease.state,
                });
            }
        }
        Err(RegistryError::Contended(stream_key.to_string()))
    }

    /// Record a heartbeat for a lease the caller owns.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` on store failure or a corrupt record.
    pub async fn refresh(
        &self,
        stream_key: &StreamKey,
        owner_id: &str,
    ) -> Result<RefreshOutcome, RegistryError> {
        let key = stream_key.lease_key();

        for _ in 0..CAS_ATTEMPTS {
            let Some(current) = self.read(&key).await? else {
                return Ok(RefreshOutcome::Lost);
            };
            if current.lease.owner_id != owner_id {
                return Ok(RefreshOutcome::Lost);
            }
            if current.lease.state == LeaseState::Stopping {
                return Ok(RefreshOutcome::StopRequested);
            }

            let next = current.lease.refreshed(Utc::now());
            let next_raw = encode(&key, &next)?;
            let swap = self
                .store
                .compare_and_swap(&key, &current.raw, &next_raw, next.lease_ttl());
            if bounded(self.timeout, swap).await? {
                return Ok(RefreshOutcome::Refreshed(next));
            }
        }
        Err(RegistryError::Contended(stream_key.to_string()))
    }

    /// Delete a lease the caller owns. Returns whether anything was deleted.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` on store failure or a corrupt record.
    pub async fn release(&self, stream_key: &StreamKey, owner_id: &str) -> Result<bool, RegistryError> {
        let key = stream_key.lease_key();

        for _ in 0..CAS_ATTEMPTS {
            let Some(current) = self.read(&key).await? else {
                return Ok(false);
            };
            if current.lease.owner_id != owner_id {
                return Ok(false);
            }
            if bounded(self.timeout, self.store.compare_and_delete(&key, &current.raw)).await? {
                debug!(stream_key = %stream_key, owner_id, "Lease released");
                return Ok(true);
            }
        }
        Err(RegistryError::Contended(stream_key.to_string()))
    }

    /// Current lease for a stream key, if any.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` on store failure or a corrupt record.
    pub async fn status(&self, stream_key: &StreamKey) -> Result<Option<StreamLease>, RegistryError> {
        Ok(self.read(&stream_key.lease_key()).await?.map(|r| r.lease))
    }

    /// Ask the owner of a lease to stop by moving it to `stopping`.
    ///
    /// The TTL is left where it is, so an owner that never observes the
    /// request still loses the lease on schedule. Returns the lease as
    /// stored afterwards, or `None` if there was no lease.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` on store failure or a corrupt record.
    pub async fn request_stop(
        &self,
        stream_key: &StreamKey,
    ) -> Result<Option<StreamLease>, RegistryError> {
        let key = stream_key.lease_key();

        for _ in 0..CAS_ATTEMPTS {
            let Some(current) = self.read(&key).await? else {
                return Ok(None);
            };
            if current.lease.state == LeaseState::Stopping {
                return Ok(Some(current.lease));
            }

            let next = current.lease.with_state(LeaseState::Stopping);
            let next_raw = encode(&key, &next)?;
            let ttl = bounded(self.timeout, self.store.remaining_ttl(&key))
                .await?
                .unwrap_or_else(|| next.lease_ttl());
            let swap = self.store.compare_and_swap(&key, &current.raw, &next_raw, ttl);
            if bounded(self.timeout, swap).await? {
                return Ok(Some(next));
            }
        }
        Err(RegistryError::Contended(stream_key.to_string()))
    }

    /// All lease records in the store. Corrupt records are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` on store failure.
    pub async fn leases(&self) -> Result<Vec<LeaseRecord>, RegistryError> {
        let mut keys = bounded(self.timeout, self.store.keys_with_prefix(LEASE_KEY_PREFIX)).await?;
        if keys.is_empty() {
            return Ok(vec![]);
        }
        keys.sort();
        let values = bounded(self.timeout, self.store.get_many(&keys)).await?;

        let mut records = Vec::with_capacity(keys.len());
        for (key, raw) in keys.iter().zip(values) {
            let Some(raw) = raw else { continue };
            match StreamLease::decode(&raw) {
                Ok(lease) => records.push(LeaseRecord { lease, raw }),
                Err(e) => warn!(key = %key, error = %e, "Skipping corrupt lease record"),
            }
        }
        Ok(records)
    }

    /// Delete a lease only if it still holds exactly `expected_raw`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` on store failure.
    pub async fn force_release(
        &self,
        stream_key: &StreamKey,
        expected_raw: &str,
    ) -> Result<bool, RegistryError> {
        let key = stream_key.lease_key();
        Ok(bounded(self.timeout, self.store.compare_and_delete(&key, expected_raw)).await?)
    }

    async fn read(&self, key: &str) -> Result<Option<LeaseRecord>, RegistryError> {
        let Some(raw) = bounded(self.timeout, self.store.get(key)).await? else {
            return Ok(None);
        };
        let lease = StreamLease::decode(&raw).map_err(|source| RegistryError::Corrupt {
            key: key.to_string(),
            source,
        })?;
        Ok(Some(LeaseRecord { lease, raw }))
    }
}

fn encode(key: &str, lease: &StreamLease) -> Result<String, RegistryError> {
    lease.encode().map_err(|source| RegistryError::Corrupt {
        key: key.to_string(),
        source,
    })
}

// =============================================================================
// Tests
// =============================================================================
