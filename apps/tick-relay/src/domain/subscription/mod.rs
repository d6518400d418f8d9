//! Client Interest Tracking
//!
//! Domain types for tracking which push sessions want which instruments.
//!
//! # Design
//!
//! The index keeps two views of the same relation:
//! - session → interest set, to apply per-session updates and disconnects
//! - instrument → sessions, so each tick is matched in one lookup rather
//!   than by scanning every session
//!
//! Interest is strictly process-local; it is never written to the shared
//! store.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::domain::streaming::InstrumentKey;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a push session within this process.
pub type SessionId = u64;

/// Difference between two interest sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterestChanges {
    /// Instruments newly of interest.
    pub added: BTreeSet<InstrumentKey>,
    /// Instruments no longer of interest.
    pub removed: BTreeSet<InstrumentKey>,
}

impl InterestChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Changes needed to move from `current` to `desired`.
    #[must_use]
    pub fn between<'a>(
        current: impl IntoIterator<Item = &'a InstrumentKey>,
        desired: impl IntoIterator<Item = &'a InstrumentKey>,
    ) -> Self {
        let current: BTreeSet<_> = current.into_iter().cloned().collect();
        let desired: BTreeSet<_> = desired.into_iter().cloned().collect();
        Self {
            added: desired.difference(&current).cloned().collect(),
            removed: current.difference(&desired).cloned().collect(),
        }
    }
}

// =============================================================================
// Interest Index
// =============================================================================

/// Bidirectional session/instrument interest index.
///
/// Not internally synchronized; `ClientFanout` wraps it in a lock.
#[derive(Debug, Default)]
pub struct InterestIndex {
    by_session: HashMap<SessionId, HashSet<InstrumentKey>>,
    by_instrument: HashMap<InstrumentKey, HashSet<SessionId>>,
}

impl InterestIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session with no interest.
    pub fn register(&mut self, session: SessionId) {
        self.by_session.entry(session).or_default();
    }

    /// Whether the session is registered.
    #[must_use]
    pub fn contains_session(&self, session: SessionId) -> bool {
        self.by_session.contains_key(&session)
    }

    /// Add instruments to a session's interest.
    ///
    /// Returns the instruments that were not already present. Unknown
    /// sessions are ignored.
    pub fn add(&mut self, session: SessionId, keys: &[InstrumentKey]) -> Vec<InstrumentKey> {
        let Some(interest) = self.by_session.get_mut(&session) else {
            return vec![];
        };

        let mut added = Vec::new();
        for key in keys {
            if interest.insert(key.clone()) {
                self.by_instrument
                    .entry(key.clone())
                    .or_default()
                    .insert(session);
                added.push(key.clone());
            }
        }
        added
    }

    /// Remove instruments from a session's interest.
    ///
    /// Returns the instruments that were actually removed.
    pub fn remove(&mut self, session: SessionId, keys: &[InstrumentKey]) -> Vec<InstrumentKey> {
        let Some(interest) = self.by_session.get_mut(&session) else {
            return vec![];
        };

        let mut removed = Vec::new();
        for key in keys {
            if interest.remove(key) {
                Self::unlink(&mut self.by_instrument, key, session);
                removed.push(key.clone());
            }
        }
        removed
    }

    /// Replace a session's interest set.
    pub fn replace(&mut self, session: SessionId, keys: &[InstrumentKey]) -> InterestChanges {
        let Some(current) = self.by_session.get(&session) else {
            return InterestChanges::default();
        };
        let changes = InterestChanges::between(current.iter(), keys.iter());

        let removed: Vec<_> = changes.removed.iter().cloned().collect();
        let added: Vec<_> = changes.added.iter().cloned().collect();
        self.remove(session, &removed);
        self.add(session, &added);

        changes
    }

    /// Drop a session and all of its interest.
    ///
    /// Returns the instruments the session was interested in.
    pub fn remove_session(&mut self, session: SessionId) -> Vec<InstrumentKey> {
        let Some(interest) = self.by_session.remove(&session) else {
            return vec![];
        };

        for key in &interest {
            Self::unlink(&mut self.by_instrument, key, session);
        }
        interest.into_iter().collect()
    }

    /// Sessions interested in an instrument.
    #[must_use]
    pub fn sessions_for(&self, key: &InstrumentKey) -> Vec<SessionId> {
        self.by_instrument
            .get(key)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Interest set of a session, sorted.
    #[must_use]
    pub fn interest_of(&self, session: SessionId) -> Vec<InstrumentKey> {
        let mut keys: Vec<_> = self
            .by_session
            .get(&session)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.by_session.len()
    }

    /// Number of distinct instruments with at least one interested session.
    #[must_use]
    pub fn instrument_count(&self) -> usize {
        self.by_instrument.len()
    }

    fn unlink(
        by_instrument: &mut HashMap<InstrumentKey, HashSet<SessionId>>,
        key: &InstrumentKey,
        session: SessionId,
    ) {
        if let Some(sessions) = by_instrument.get_mut(key) {
            sessions.remove(&session);
            if sessions.is_empty() {
                by_instrument.remove(key);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> InstrumentKey {
        InstrumentKey::parse(raw, "NSE").unwrap()
    }

    #[test]
    fn add_links_both_directions() {
        let mut index = InterestIndex::new();
        index.register(1);

        let added = index.add(1, &[key("NSE:1"), key("NSE:2")]);

        assert_eq!(added.len(), 2);
        assert_eq!(index.sessions_for(&key("NSE:1")), vec![1]);
        assert_eq!(index.interest_of(1), vec![key("NSE:1"), key("NSE:2")]);
    }

    #[test]
    fn add_duplicate_is_noop() {
        let mut index = InterestIndex::new();
        index.register(1);
        index.add(1, &[key("NSE:1")]);

        assert!(index.add(1, &[key("NSE:1")]).is_empty());
        assert_eq!(index.instrument_count(), 1);
    }

    #[test]
    fn add_for_unknown_session_ignored() {
        let mut index = InterestIndex::new();
        assert!(index.add(9, &[key("NSE:1")]).is_empty());
        assert_eq!(index.instrument_count(), 0);
    }

    #[test]
    fn shared_instrument_survives_one_session_leaving() {
        let mut index = InterestIndex::new();
        index.register(1);
        index.register(2);
        index.add(1, &[key("NSE:1")]);
        index.add(2, &[key("NSE:1")]);

        index.remove_session(1);

        assert_eq!(index.sessions_for(&key("NSE:1")), vec![2]);
        assert!(!index.contains_session(1));
    }

    #[test]
    fn remove_last_session_clears_instrument() {
        let mut index = InterestIndex::new();
        index.register(1);
        index.add(1, &[key("NSE:1")]);

        let removed = index.remove(1, &[key("NSE:1")]);

        assert_eq!(removed, vec![key("NSE:1")]);
        assert!(index.sessions_for(&key("NSE:1")).is_empty());
        assert_eq!(index.instrument_count(), 0);
        assert!(index.contains_session(1));
    }

    #[test]
    fn replace_reports_diff() {
        let mut index = InterestIndex::new();
        index.register(1);
        index.add(1, &[key("NSE:1"), key("NSE:2")]);

        let changes = index.replace(1, &[key("NSE:2"), key("NSE:3")]);

        assert_eq!(changes.added.into_iter().collect::<Vec<_>>(), vec![key("NSE:3")]);
        assert_eq!(changes.removed.into_iter().collect::<Vec<_>>(), vec![key("NSE:1")]);
        assert_eq!(index.interest_of(1), vec![key("NSE:2"), key("NSE:3")]);
        assert!(index.sessions_for(&key("NSE:1")).is_empty());
    }

    #[test]
    fn changes_between_identical_sets_empty() {
        let a = [key("NSE:1"), key("NSE:2")];
        assert!(InterestChanges::between(a.iter(), a.iter()).is_empty());
    }

    #[test]
    fn remove_unknown_session_returns_nothing() {
        let mut index = InterestIndex::new();
        assert!(index.remove_session(42).is_empty());
        assert_eq!(index.session_count(), 0);
    }
}
