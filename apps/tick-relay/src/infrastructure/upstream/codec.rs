//! Feed Codec
//!
//! Binary packet decoding for the upstream market feed, plus the mapping
//! between exchange segment names and their wire codes.
//!
//! # Packet Layout
//!
//! Every packet starts with an 8-byte little-endian header:
//!
//! | Offset | Size | Field                         |
//! |--------|------|-------------------------------|
//! | 0      | 1    | response code                 |
//! | 1      | 2    | message length (whole packet) |
//! | 3      | 1    | exchange segment              |
//! | 4      | 4    | security id                   |
//!
//! Ticker (2), quote (4) and full (8) packets carry the last traded price as
//! an `f32` at offset 8. Ticker packets carry the trade time as `u32` epoch
//! seconds at offset 12; quote and full packets carry it at offset 14.
//! Code 50 is a server-initiated disconnect with a `u16` reason at offset 8.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Header size in bytes.
pub const HEADER_LEN: usize = 8;

/// Response codes the relay acts on.
pub mod response_code {
    /// Last traded price and time.
    pub const TICKER: u8 = 2;
    /// Quote packet (price, quantity, time, depth summary).
    pub const QUOTE: u8 = 4;
    /// Full packet (quote plus market depth).
    pub const FULL: u8 = 8;
    /// Server is closing the connection.
    pub const DISCONNECT: u8 = 50;
}

/// Segment names and their wire codes.
const SEGMENTS: &[(&str, u8)] = &[
    ("IDX_I", 0),
    ("NSE_EQ", 1),
    ("NSE_FNO", 2),
    ("NSE_CURRENCY", 3),
    ("BSE_EQ", 4),
    ("MCX_COMM", 5),
    ("BSE_CURRENCY", 7),
    ("BSE_FNO", 8),
];

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Packet shorter than its declared layout.
    #[error("packet truncated: code {code} needs {needed} bytes, got {actual}")]
    Truncated {
        /// Response code from the header.
        code: u8,
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Price field is NaN or infinite.
    #[error("non-finite price for security {0}")]
    InvalidPrice(u32),

    /// Segment name has no wire code.
    #[error("unknown exchange segment: {0}")]
    UnknownSegment(String),

    /// Security id is not numeric.
    #[error("security id is not numeric: {0}")]
    InvalidSecurityId(String),
}

/// Wire code for a segment name. `NSE` and `BSE` are accepted as aliases
/// for the equity segments; matching ignores ASCII case.
///
/// # Errors
///
/// Returns `CodecError::UnknownSegment` for an unrecognised name.
pub fn segment_code(name: &str) -> Result<u8, CodecError> {
    let upper = name.trim().to_ascii_uppercase();
    let canonical = match upper.as_str() {
        "NSE" => "NSE_EQ",
        "BSE" => "BSE_EQ",
        other => other,
    };
    SEGMENTS
        .iter()
        .find(|(n, _)| *n == canonical)
        .map(|(_, code)| *code)
        .ok_or_else(|| CodecError::UnknownSegment(name.to_string()))
}

/// Canonical segment name for a wire code.
#[must_use]
pub fn segment_name(code: u8) -> Option<&'static str> {
    SEGMENTS.iter().find(|(_, c)| *c == code).map(|(n, _)| *n)
}

/// Numeric security id as sent on the wire.
///
/// # Errors
///
/// Returns `CodecError::InvalidSecurityId` if `id` is not a `u32`.
pub fn security_id(id: &str) -> Result<u32, CodecError> {
    id.parse()
        .map_err(|_| CodecError::InvalidSecurityId(id.to_string()))
}

/// One decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedPacket {
    /// Price update.
    Price {
        /// Segment wire code.
        segment: u8,
        /// Security id.
        security_id: u32,
        /// Last traded price.
        price: Decimal,
        /// Exchange trade time, absent when the feed sends zero.
        traded_at: Option<DateTime<Utc>>,
    },
    /// Server is disconnecting.
    Disconnect {
        /// Reason code.
        reason: u16,
    },
    /// Packet type the relay does not use.
    Ignored {
        /// Response code.
        code: u8,
    },
}

/// Decode every packet in one binary frame.
///
/// # Errors
///
/// Returns `CodecError` if a packet is truncated or carries a non-finite
/// price. Packets before the bad one are discarded with it.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<FeedPacket>, CodecError> {
    let mut packets = Vec::new();
    let mut rest = frame;
    while !rest.is_empty() {
        let (packet, consumed) = decode_packet(rest)?;
        packets.push(packet);
        rest = &rest[consumed..];
    }
    Ok(packets)
}

/// Decode one packet from the front of `buf`, returning it with the number
/// of bytes it occupied.
fn decode_packet(buf: &[u8]) -> Result<(FeedPacket, usize), CodecError> {
    let code = buf.first().copied().unwrap_or_default();
    ensure_len(buf, code, HEADER_LEN)?;

    let declared = usize::from(read_u16(buf, 1));
    let segment = buf[3];
    let security_id = read_u32(buf, 4);

    let (packet, minimum) = match code {
        response_code::TICKER => {
            ensure_len(buf, code, 16)?;
            (price_packet(segment, security_id, buf, 12)?, 16)
        }
        response_code::QUOTE | response_code::FULL => {
            ensure_len(buf, code, 18)?;
            (price_packet(segment, security_id, buf, 14)?, 18)
        }
        response_code::DISCONNECT => {
            ensure_len(buf, code, 10)?;
            (
                FeedPacket::Disconnect {
                    reason: read_u16(buf, 8),
                },
                10,
            )
        }
        other => (FeedPacket::Ignored { code: other }, HEADER_LEN),
    };

    // Trust the declared length when it covers the layout and fits the frame;
    // otherwise treat the rest of the frame as this packet.
    let consumed = if declared >= minimum && declared <= buf.len() {
        declared
    } else {
        buf.len()
    };
    Ok((packet, consumed))
}

fn price_packet(
    segment: u8,
    security_id: u32,
    buf: &[u8],
    time_offset: usize,
) -> Result<FeedPacket, CodecError> {
    let raw = f32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    if !raw.is_finite() {
        return Err(CodecError::InvalidPrice(security_id));
    }
    // Shortest decimal rendering of the f32, so 101.55 stays 101.55.
    let price = raw
        .to_string()
        .parse::<Decimal>()
        .map_err(|_| CodecError::InvalidPrice(security_id))?;
    let seconds = read_u32(buf, time_offset);
    let traded_at = (seconds > 0)
        .then(|| DateTime::from_timestamp(i64::from(seconds), 0))
        .flatten();

    Ok(FeedPacket::Price {
        segment,
        security_id,
        price,
        traded_at,
    })
}

const fn ensure_len(buf: &[u8], code: u8, needed: usize) -> Result<(), CodecError> {
    if buf.len() < needed {
        return Err(CodecError::Truncated {
            code,
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
