//! Market Data Streaming Types
//!
//! Core domain types for the tick relay: instrument identifiers, the
//! canonical stream key that names one logical upstream subscription,
//! and the tick event that travels over the broadcast topic.
//!
//! These types are codec-agnostic. Wire formats for the upstream feed live
//! in `infrastructure::upstream`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while parsing or constructing keys.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// Instrument key is empty or malformed.
    #[error("invalid instrument key: {0:?}")]
    InvalidInstrument(String),
    /// Stream key has no subscription type tag.
    #[error("stream key requires a subscription type")]
    MissingType,
    /// Stream key has no instrument identifiers.
    #[error("stream key requires at least one instrument id")]
    NoInstruments,
    /// Identifier contains a reserved separator.
    #[error("identifier {0:?} contains a reserved character")]
    ReservedCharacter(String),
    /// Rendered stream key could not be parsed.
    #[error("malformed stream key: {0:?}")]
    Malformed(String),
}

// =============================================================================
// Instrument Key
// =============================================================================

/// Long segment names folded onto the short alias keys carry.
const SEGMENT_ALIASES: &[(&str, &str)] = &[("NSE_EQ", "NSE"), ("BSE_EQ", "BSE")];

/// Canonical spelling of a segment name.
///
/// Upper-cased, with `NSE_EQ` and `BSE_EQ` written as `NSE` and `BSE`, so
/// every spelling of one segment yields the same cache and stream keys.
#[must_use]
pub fn canonical_segment(segment: &str) -> String {
    let upper = segment.trim().to_ascii_uppercase();
    SEGMENT_ALIASES
        .iter()
        .find(|&&(long, _)| long == upper)
        .map_or(upper, |&(_, short)| short.to_string())
}

/// Identifies one traded instrument as `{segment}:{security_id}`.
///
/// The segment is stored in canonical form, see [`canonical_segment`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrumentKey {
    segment: String,
    security_id: String,
}

impl InstrumentKey {
    /// Create a key from its parts.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidInstrument` if either part is empty or
    /// contains whitespace or a separator.
    pub fn new(segment: &str, security_id: &str) -> Result<Self, KeyError> {
        let segment = segment.trim();
        let security_id = security_id.trim();
        let valid = |s: &str| {
            !s.is_empty() && !s.contains([':', ',', '|']) && !s.contains(char::is_whitespace)
        };
        if !valid(segment) || !valid(security_id) {
            return Err(KeyError::InvalidInstrument(format!(
                "{segment}:{security_id}"
            )));
        }
        Ok(Self {
            segment: canonical_segment(segment),
            security_id: security_id.to_string(),
        })
    }

    /// Parse `SEG:ID`, or a bare `ID` qualified with `default_segment`.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidInstrument` for empty or malformed input.
    pub fn parse(raw: &str, default_segment: &str) -> Result<Self, KeyError> {
        let raw = raw.trim();
        match raw.split_once(':') {
            Some((segment, id)) => Self::new(segment, id),
            None => Self::new(default_segment, raw),
        }
    }

    /// Canonical exchange segment name.
    #[must_use]
    pub fn segment(&self) -> &str {
        &self.segment
    }

    /// Security identifier within the segment.
    #[must_use]
    pub fn security_id(&self) -> &str {
        &self.security_id
    }

    /// Key of this instrument's latest-price entry in the shared store.
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("price:{}:{}", self.segment, self.security_id)
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.security_id)
    }
}

impl Serialize for InstrumentKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InstrumentKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let (segment, id) = raw
            .split_once(':')
            .ok_or_else(|| serde::de::Error::custom(format!("missing segment in {raw:?}")))?;
        Self::new(segment, id).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Stream Key
// =============================================================================

/// Canonical name of one logical upstream subscription.
///
/// Rendered as `type:{tag}|ids:{id},{id},...` with ids sorted and
/// deduplicated, so the same instrument set always maps to the same key
/// regardless of request order. Used as the namespace for leases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    subscription_type: String,
    ids: BTreeSet<String>,
}

impl StreamKey {
    /// Build a key from a subscription type and instrument identifiers.
    ///
    /// # Errors
    ///
    /// Fails on an empty type, an empty id set, or reserved characters.
    pub fn new<I, S>(subscription_type: &str, ids: I) -> Result<Self, KeyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let subscription_type = subscription_type.trim();
        if subscription_type.is_empty() {
            return Err(KeyError::MissingType);
        }
        if subscription_type.contains(['|', ',']) {
            return Err(KeyError::ReservedCharacter(subscription_type.to_string()));
        }

        let mut set = BTreeSet::new();
        for id in ids {
            let id = id.as_ref().trim();
            if id.is_empty() {
                continue;
            }
            if id.contains(['|', ',']) {
                return Err(KeyError::ReservedCharacter(id.to_string()));
            }
            set.insert(id.to_string());
        }
        if set.is_empty() {
            return Err(KeyError::NoInstruments);
        }

        Ok(Self {
            subscription_type: subscription_type.to_string(),
            ids: set,
        })
    }

    /// Subscription type tag.
    #[must_use]
    pub fn subscription_type(&self) -> &str {
        &self.subscription_type
    }

    /// Sorted, deduplicated identifiers.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    /// Key of this stream's lease record in the shared store.
    #[must_use]
    pub fn lease_key(&self) -> String {
        format!("{LEASE_KEY_PREFIX}{self}")
    }
}

/// Prefix shared by all lease records.
pub const LEASE_KEY_PREFIX: &str = "lease:";

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type:{}|ids:", self.subscription_type)?;
        for (i, id) in self.ids.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(id)?;
        }
        Ok(())
    }
}

impl FromStr for StreamKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || KeyError::Malformed(s.to_string());
        let (type_part, ids_part) = s.split_once('|').ok_or_else(malformed)?;
        let tag = type_part.strip_prefix("type:").ok_or_else(malformed)?;
        let ids = ids_part.strip_prefix("ids:").ok_or_else(malformed)?;
        Self::new(tag, ids.split(','))
    }
}

impl Serialize for StreamKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StreamKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tick Event
// =============================================================================

/// Where a price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickSource {
    /// Live upstream feed connection.
    Websocket,
    /// REST quote fallback used by bulk reads.
    Rest,
}

/// One received price update, published once on the broadcast topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickEvent {
    /// Instrument the price belongs to.
    pub instrument_key: InstrumentKey,
    /// Display symbol.
    pub symbol: String,
    /// Last traded price.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    /// Exchange or receive time of the tick.
    pub timestamp: DateTime<Utc>,
    /// Origin of the price.
    pub source: TickSource,
}

// =============================================================================
// Push Messages
// =============================================================================

/// Expectations a push client must honour.
///
/// Push delivery is at-most-once with no replay, so clients re-poll the
/// bulk endpoint when the channel goes quiet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContract {
    /// Interval at which clients poll while push is silent.
    pub poll_interval: Duration,
    /// Silence after which clients switch to polling.
    pub push_silence: Duration,
    /// Path of the bulk read endpoint.
    pub bulk_endpoint: String,
}

impl Default for ClientContract {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            push_silence: Duration::from_secs(15),
            bulk_endpoint: "/quotes".to_string(),
        }
    }
}

/// Messages sent to a connected push client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// First message on a new connection.
    Hello {
        /// Session identifier assigned by this process.
        session_id: String,
        /// Polling interval for the fallback path.
        poll_interval_secs: u64,
        /// Push silence before falling back to polling.
        push_silence_secs: u64,
        /// Bulk read endpoint for the fallback path.
        bulk_endpoint: String,
    },
    /// A price update.
    TickUpdate(TickEvent),
    /// A request the client sent could not be applied.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl PushMessage {
    /// Build the greeting for a session.
    #[must_use]
    pub fn hello(session_id: &str, contract: &ClientContract) -> Self {
        Self::Hello {
            session_id: session_id.to_string(),
            poll_interval_secs: contract.poll_interval.as_secs(),
            push_silence_secs: contract.push_silence.as_secs(),
            bulk_endpoint: contract.bulk_endpoint.clone(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case("NSE:1", "NSE", "1" ; "qualified")]
    #[test_case("1", "NSE", "1" ; "bare id uses default segment")]
    #[test_case(" NSE_EQ:2885 ", "NSE", "2885" ; "whitespace trimmed")]
    #[test_case("BSE:500325", "BSE", "500325" ; "other segment")]
    #[test_case("bse_eq:500325", "BSE", "500325" ; "lower-case long alias")]
    #[test_case("NSE_FNO:35001", "NSE_FNO", "35001" ; "segment without alias")]
    fn instrument_key_parsing(raw: &str, segment: &str, id: &str) {
        let key = InstrumentKey::parse(raw, "NSE").unwrap();
        assert_eq!(key.segment(), segment);
        assert_eq!(key.security_id(), id);
    }

    #[test_case("" ; "empty")]
    #[test_case("NSE:" ; "missing id")]
    #[test_case(":1" ; "missing segment")]
    #[test_case("NSE:1 2" ; "inner whitespace")]
    fn instrument_key_rejects(raw: &str) {
        assert!(InstrumentKey::parse(raw, "NSE").is_err());
    }

    #[test]
    fn instrument_cache_key() {
        let key = InstrumentKey::parse("NSE:1", "NSE").unwrap();
        assert_eq!(key.cache_key(), "price:NSE:1");
        assert_eq!(key.to_string(), "NSE:1");
    }

    #[test]
    fn segment_aliases_name_one_instrument() {
        let long = InstrumentKey::parse("NSE_EQ:1", "NSE").unwrap();
        let bare = InstrumentKey::parse("1", "NSE").unwrap();
        let short_default = InstrumentKey::parse("1", "nse_eq").unwrap();

        assert_eq!(long, bare);
        assert_eq!(bare, short_default);
        assert_eq!(long.cache_key(), "price:NSE:1");

        let decoded: InstrumentKey = serde_json::from_str("\"NSE_EQ:1\"").unwrap();
        assert_eq!(decoded, bare);
    }

    #[test]
    fn stream_key_sorted_and_deduplicated() {
        let key = StreamKey::new("swing", ["3", "1", "2", "1"]).unwrap();
        assert_eq!(key.to_string(), "type:swing|ids:1,2,3");
        assert_eq!(key.lease_key(), "lease:type:swing|ids:1,2,3");
    }

    #[test]
    fn stream_key_rejects_empty_inputs() {
        assert_eq!(
            StreamKey::new("", ["1"]).unwrap_err(),
            KeyError::MissingType
        );
        assert_eq!(
            StreamKey::new("swing", Vec::<String>::new()).unwrap_err(),
            KeyError::NoInstruments
        );
        assert!(matches!(
            StreamKey::new("swing", ["1|2"]),
            Err(KeyError::ReservedCharacter(_))
        ));
    }

    #[test]
    fn stream_key_parses_rendered_form() {
        let key = StreamKey::from_str("type:swing|ids:1,2,3").unwrap();
        assert_eq!(key.subscription_type(), "swing");
        assert_eq!(key.ids().collect::<Vec<_>>(), vec!["1", "2", "3"]);
        assert!(StreamKey::from_str("swing|1,2").is_err());
    }

    #[test]
    fn tick_update_wire_shape() {
        let event = TickEvent {
            instrument_key: InstrumentKey::parse("NSE:1", "NSE").unwrap(),
            symbol: "RELIANCE".to_string(),
            price: Decimal::new(1015, 1),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            source: TickSource::Websocket,
        };
        let json = serde_json::to_value(PushMessage::TickUpdate(event.clone())).unwrap();
        assert_eq!(json["type"], "tick_update");
        assert_eq!(json["instrument_key"], "NSE:1");
        assert_eq!(json["price"], 101.5);
        assert_eq!(json["source"], "websocket");

        let decoded: TickEvent = serde_json::from_str(&serde_json::to_string(&event).unwrap())
            .unwrap();
        assert_eq!(decoded, event);
    }

    proptest! {
        #[test]
        fn stream_key_is_order_independent(ids in proptest::collection::vec("[a-z0-9]{1,6}", 1..12)) {
            let forward = StreamKey::new("t", ids.iter()).unwrap();
            let mut reversed_ids = ids.clone();
            reversed_ids.reverse();
            let reversed = StreamKey::new("t", reversed_ids.iter()).unwrap();
            prop_assert_eq!(&forward, &reversed);
            prop_assert_eq!(StreamKey::from_str(&forward.to_string()).unwrap(), forward);
        }
    }
}
