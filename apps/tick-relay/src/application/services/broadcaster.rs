//! Publishes tick events on the shared broadcast topic.

use std::sync::Arc;
use std::time::Duration;

use crate::application::ports::{DEFAULT_STORE_TIMEOUT, PubSub, StoreError, bounded};
use crate::domain::streaming::TickEvent;

/// Default broadcast topic name.
pub const DEFAULT_TOPIC: &str = "ticks";

/// Serializes tick events and publishes them on one topic.
#[derive(Clone)]
pub struct TickBroadcaster {
    bus: Arc<dyn PubSub>,
    topic: String,
    timeout: Duration,
}

impl std::fmt::Debug for TickBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickBroadcaster")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl TickBroadcaster {
    /// Create a broadcaster for `topic`.
    #[must_use]
    pub fn new(bus: Arc<dyn PubSub>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Bound each publish by `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Topic events are published on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish one event. Returns the receiver count reported by the store.
    ///
    /// # Errors
    ///
    /// Returns the store error if publishing fails.
    pub async fn publish(&self, event: &TickEvent) -> Result<usize, StoreError> {
        let payload =
            serde_json::to_string(event).map_err(|e| StoreError::Protocol(e.to_string()))?;
        bounded(self.timeout, self.bus.publish(&self.topic, &payload)).await
    }
}
