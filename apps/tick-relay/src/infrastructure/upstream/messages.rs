//! Feed Request Messages
//!
//! JSON control messages sent to the upstream feed.
//!
//! # Wire Format
//!
//! ```json
//! {"RequestCode":15,"InstrumentCount":2,"InstrumentList":[
//!   {"ExchangeSegment":"NSE_EQ","SecurityId":"1"},
//!   {"ExchangeSegment":"NSE_EQ","SecurityId":"2"}]}
//! ```
//!
//! The feed accepts at most [`MAX_INSTRUMENTS_PER_REQUEST`] instruments per
//! message, so larger sets are split into several requests.

use serde::Serialize;

use super::codec::{self, CodecError};
use crate::domain::streaming::InstrumentKey;

/// Instruments allowed in one request.
pub const MAX_INSTRUMENTS_PER_REQUEST: usize = 100;

/// Request codes understood by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCode {
    /// Close the connection.
    Disconnect,
    /// Subscribe to ticker packets.
    SubscribeTicker,
    /// Unsubscribe ticker packets.
    UnsubscribeTicker,
}

impl RequestCode {
    /// Numeric code on the wire.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Disconnect => 12,
            Self::SubscribeTicker => 15,
            Self::UnsubscribeTicker => 16,
        }
    }
}

impl Serialize for RequestCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

/// One instrument in a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstrumentRef {
    /// Canonical segment name.
    pub exchange_segment: &'static str,
    /// Security id.
    pub security_id: String,
}

impl InstrumentRef {
    /// Wire reference for an instrument, with its segment canonicalised.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` for an unknown segment or non-numeric id.
    pub fn from_key(key: &InstrumentKey) -> Result<Self, CodecError> {
        let code = codec::segment_code(key.segment())?;
        codec::security_id(key.security_id())?;
        let exchange_segment = codec::segment_name(code)
            .ok_or_else(|| CodecError::UnknownSegment(key.segment().to_string()))?;
        Ok(Self {
            exchange_segment,
            security_id: key.security_id().to_string(),
        })
    }
}

/// A control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FeedRequest {
    /// What the request does.
    pub request_code: RequestCode,
    /// Entries in `instrument_list`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument_count: Option<usize>,
    /// Instruments affected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument_list: Option<Vec<InstrumentRef>>,
}

impl FeedRequest {
    /// Ask the server to close the connection.
    #[must_use]
    pub const fn disconnect() -> Self {
        Self {
            request_code: RequestCode::Disconnect,
            instrument_count: None,
            instrument_list: None,
        }
    }

    /// Split `instruments` into requests of at most
    /// [`MAX_INSTRUMENTS_PER_REQUEST`] entries each.
    #[must_use]
    pub fn batched(code: RequestCode, instruments: &[InstrumentRef]) -> Vec<Self> {
        instruments
            .chunks(MAX_INSTRUMENTS_PER_REQUEST)
            .map(|chunk| Self {
                request_code: code,
                instrument_count: Some(chunk.len()),
                instrument_list: Some(chunk.to_vec()),
            })
            .collect()
    }

    /// Serialize to JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(n: usize) -> Vec<InstrumentRef> {
        (0..n)
            .map(|i| InstrumentRef {
                exchange_segment: "NSE_EQ",
                security_id: i.to_string(),
            })
            .collect()
    }

    #[test]
    fn subscribe_request_wire_format() {
        let key = InstrumentKey::parse("NSE:2885", "NSE").unwrap();
        let reference = InstrumentRef::from_key(&key).unwrap();
        let requests = FeedRequest::batched(RequestCode::SubscribeTicker, &[reference]);

        let json: serde_json::Value = serde_json::from_str(&requests[0].to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "RequestCode": 15,
                "InstrumentCount": 1,
                "InstrumentList": [{"ExchangeSegment": "NSE_EQ", "SecurityId": "2885"}]
            })
        );
    }

    #[test]
    fn large_sets_split_at_limit() {
        let requests = FeedRequest::batched(RequestCode::UnsubscribeTicker, &refs(250));
        let counts: Vec<_> = requests.iter().map(|r| r.instrument_count).collect();
        assert_eq!(counts, vec![Some(100), Some(100), Some(50)]);
        assert!(requests.iter().all(|r| r.request_code.code() == 16));
    }

    #[test]
    fn empty_set_sends_nothing() {
        assert!(FeedRequest::batched(RequestCode::SubscribeTicker, &[]).is_empty());
    }

    #[test]
    fn disconnect_has_no_list() {
        assert_eq!(
            FeedRequest::disconnect().to_json().unwrap(),
            r#"{"RequestCode":12}"#
        );
    }

    #[test]
    fn non_numeric_security_id_rejected() {
        let key = InstrumentKey::parse("NSE:RELIANCE", "NSE").unwrap();
        assert!(matches!(
            InstrumentRef::from_key(&key),
            Err(CodecError::InvalidSecurityId(_))
        ));
    }
}
