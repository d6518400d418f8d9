//! Shared Store Adapters
//!
//! Implementations of [`KeyValueStore`] and [`PubSub`]:
//!
//! - [`RedisStore`]: the fleet-wide store, selected with a `redis://` URL
//! - [`MemoryStore`]: process-local, for single-instance runs and tests

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::application::ports::{KeyValueStore, PubSub, StoreError};

/// URL that selects the in-process store.
pub const MEMORY_STORE_URL: &str = "memory://";

/// One store seen through both ports.
#[derive(Clone)]
pub struct SharedStore {
    /// Key/value side.
    pub kv: Arc<dyn KeyValueStore>,
    /// Publish/subscribe side.
    pub bus: Arc<dyn PubSub>,
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore").finish_non_exhaustive()
    }
}

impl SharedStore {
    /// Wrap a store that implements both ports.
    #[must_use]
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: KeyValueStore + PubSub + 'static,
    {
        Self {
            kv: store.clone(),
            bus: store,
        }
    }

    /// Open the store named by `url`.
    ///
    /// `memory://` gives a process-local store; anything else is handed to
    /// the Redis client.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the Redis store cannot be reached.
    pub async fn open(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        if url.starts_with(MEMORY_STORE_URL) || url == "memory" {
            tracing::warn!("Using in-process store; leases are not shared across instances");
            return Ok(Self::from_store(Arc::new(MemoryStore::new())));
        }
        let store = RedisStore::connect(url, timeout).await?;
        Ok(Self::from_store(Arc::new(store)))
    }
}
