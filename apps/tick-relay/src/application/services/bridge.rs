//! Subscriber Bridge
//!
//! One per process: a single subscription to the broadcast topic whose
//! events are handed to [`ClientFanout`]. If the subscription ends (store
//! restart, dropped connection) it is re-established with backoff; ticks
//! published in the gap are lost, which push clients cover by polling.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fanout::{ClientFanout, DeliveryReport};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{DEFAULT_STORE_TIMEOUT, PubSub, bounded};
use crate::domain::streaming::TickEvent;

/// Bridges the broadcast topic into local push sessions.
pub struct SubscriberBridge {
    bus: Arc<dyn PubSub>,
    topic: String,
    fanout: Arc<ClientFanout>,
    reconnect: ReconnectConfig,
    timeout: Duration,
    subscribed: watch::Sender<bool>,
}

impl std::fmt::Debug for SubscriberBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberBridge")
            .field("topic", &self.topic)
            .field("subscribed", &*self.subscribed.borrow())
            .finish_non_exhaustive()
    }
}

impl SubscriberBridge {
    /// Create a bridge for `topic`.
    #[must_use]
    pub fn new(
        bus: Arc<dyn PubSub>,
        topic: impl Into<String>,
        fanout: Arc<ClientFanout>,
        reconnect: ReconnectConfig,
    ) -> Self {
        let (subscribed, _) = watch::channel(false);
        Self {
            bus,
            topic: topic.into(),
            fanout,
            reconnect,
            timeout: DEFAULT_STORE_TIMEOUT,
            subscribed,
        }
    }

    /// Bound each subscribe attempt by `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the topic subscription is currently live.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        *self.subscribed.borrow()
    }

    /// Wait until the topic subscription is live.
    pub async fn wait_subscribed(&self) {
        let mut rx = self.subscribed.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|live| *live).await;
    }

    /// Decode one payload and deliver it. Undecodable payloads are skipped.
    pub fn handle_payload(&self, raw: &str) -> Option<DeliveryReport> {
        match serde_json::from_str::<TickEvent>(raw) {
            Ok(event) => Some(self.fanout.deliver(&event)),
            Err(e) => {
                warn!(error = %e, "Skipping undecodable broadcast payload");
                None
            }
        }
    }

    /// Consume the topic until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut policy = ReconnectPolicy::new(self.reconnect.clone());

        loop {
            let subscription = tokio::select! {
                () = cancel.cancelled() => break,
                result = bounded(self.timeout, self.bus.subscribe(&self.topic)) => result,
            };

            match subscription {
                Ok(mut stream) => {
                    policy.reset();
                    self.subscribed.send_replace(true);
                    info!(topic = %self.topic, "Subscribed to broadcast topic");

                    loop {
                        let payload = tokio::select! {
                            biased;
                            () = cancel.cancelled() => None,
                            payload = stream.next() => payload,
                        };
                        let Some(payload) = payload else { break };
                        if let Some(report) = self.handle_payload(&payload) {
                            debug!(matched = report.matched, dropped = report.dropped, "Broadcast tick fanned out");
                        }
                    }

                    self.subscribed.send_replace(false);
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(topic = %self.topic, "Broadcast subscription ended");
                }
                Err(e) => warn!(topic = %self.topic, error = %e, "Broadcast subscribe failed"),
            }

            let delay = policy.next_delay(Duration::MAX).unwrap_or_default();
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.subscribed.send_replace(false);
        info!(topic = %self.topic, "Subscriber bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::application::services::broadcaster::TickBroadcaster;
    use crate::domain::streaming::{InstrumentKey, TickSource};
    use crate::infrastructure::store::MemoryStore;

    #[tokio::test]
    async fn bridge_routes_published_ticks_to_sessions() {
        let store = Arc::new(MemoryStore::new());
        let fanout = Arc::new(ClientFanout::new(16));
        let bridge = Arc::new(SubscriberBridge::new(
            store.clone(),
            "ticks",
            fanout.clone(),
            ReconnectConfig::default(),
        ));
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let bridge = bridge.clone();
            let cancel = cancel.clone();
            async move { bridge.run(cancel).await }
        });
        bridge.wait_subscribed().await;

        let key = InstrumentKey::parse("NSE:1", "NSE").unwrap();
        let (session, mut rx) = fanout.connect();
        fanout.set_interest(session, std::slice::from_ref(&key));

        TickBroadcaster::new(store, "ticks")
            .publish(&TickEvent {
                instrument_key: key.clone(),
                symbol: "RELIANCE".to_string(),
                price: Decimal::new(1015, 1),
                timestamp: Utc::now(),
                source: TickSource::Websocket,
            })
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.instrument_key, key);

        cancel.cancel();
        task.await.unwrap();
        assert!(!bridge.is_subscribed());
    }

    #[test]
    fn garbage_payload_skipped() {
        let bridge = SubscriberBridge::new(
            Arc::new(MemoryStore::new()),
            "ticks",
            Arc::new(ClientFanout::default()),
            ReconnectConfig::default(),
        );
        assert!(bridge.handle_payload("not json").is_none());
    }
}
