//! Client Fan-out
//!
//! Per-process registry of push sessions and their interest sets. Each
//! session gets a bounded outbound buffer; when it is full the new tick is
//! dropped for that session only. Delivery never awaits, so one slow
//! client cannot hold up the others.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

use crate::domain::streaming::{InstrumentKey, TickEvent};
use crate::domain::subscription::{InterestChanges, InterestIndex, SessionId};
use crate::infrastructure::metrics::{self, PushOutcome};

/// Default per-session buffer capacity.
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

/// Result of delivering one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Sessions interested in the instrument.
    pub matched: usize,
    /// Sessions the event was enqueued for.
    pub delivered: usize,
    /// Sessions whose buffer was full.
    pub dropped: usize,
    /// Sessions found closed and pruned.
    pub closed: usize,
}

#[derive(Debug, Default)]
struct FanoutState {
    index: InterestIndex,
    senders: HashMap<SessionId, mpsc::Sender<TickEvent>>,
    next_id: SessionId,
}

/// Routes tick events to interested push sessions.
#[derive(Debug)]
pub struct ClientFanout {
    state: Mutex<FanoutState>,
    capacity: usize,
}

impl ClientFanout {
    /// Create a fan-out with per-session buffer `capacity` (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(FanoutState::default()),
            capacity: capacity.max(1),
        }
    }

    /// Register a session with an empty interest set.
    pub fn connect(&self) -> (SessionId, mpsc::Receiver<TickEvent>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut state = self.state.lock();
        state.next_id += 1;
        let session = state.next_id;
        state.index.register(session);
        state.senders.insert(session, tx);
        metrics::set_push_sessions(state.senders.len());
        (session, rx)
    }

    /// Replace a session's interest set.
    pub fn set_interest(&self, session: SessionId, keys: &[InstrumentKey]) -> InterestChanges {
        self.state.lock().index.replace(session, keys)
    }

    /// Add instruments to a session's interest set.
    pub fn add_interest(&self, session: SessionId, keys: &[InstrumentKey]) -> Vec<InstrumentKey> {
        self.state.lock().index.add(session, keys)
    }

    /// Remove instruments from a session's interest set.
    pub fn remove_interest(&self, session: SessionId, keys: &[InstrumentKey]) -> Vec<InstrumentKey> {
        self.state.lock().index.remove(session, keys)
    }

    /// Current interest of a session, sorted.
    #[must_use]
    pub fn interest_of(&self, session: SessionId) -> Vec<InstrumentKey> {
        self.state.lock().index.interest_of(session)
    }

    /// Drop a session and its interest.
    pub fn disconnect(&self, session: SessionId) {
        let mut state = self.state.lock();
        state.index.remove_session(session);
        state.senders.remove(&session);
        metrics::set_push_sessions(state.senders.len());
    }

    /// Connected sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.lock().senders.len()
    }

    /// Enqueue an event for every session interested in its instrument.
    pub fn deliver(&self, event: &TickEvent) -> DeliveryReport {
        let mut state = self.state.lock();
        let sessions = state.index.sessions_for(&event.instrument_key);
        let mut report = DeliveryReport {
            matched: sessions.len(),
            ..DeliveryReport::default()
        };

        let mut closed = Vec::new();
        for session in sessions {
            let Some(sender) = state.senders.get(&session) else {
                closed.push(session);
                continue;
            };
            match sender.try_send(event.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    trace!(session, instrument = %event.instrument_key, "Push buffer full, dropping tick");
                }
                Err(TrySendError::Closed(_)) => closed.push(session),
            }
        }

        report.closed = closed.len();
        for session in closed {
            state.index.remove_session(session);
            state.senders.remove(&session);
        }
        if report.closed > 0 {
            metrics::set_push_sessions(state.senders.len());
        }
        drop(state);

        metrics::record_push(PushOutcome::Delivered, report.delivered as u64);
        metrics::record_push(PushOutcome::Dropped, report.dropped as u64);
        metrics::record_push(PushOutcome::Closed, report.closed as u64);
        report
    }
}

impl Default for ClientFanout {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_BUFFER)
    }
}
