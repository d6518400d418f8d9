//! Upstream Market Feed
//!
//! WebSocket transport implementing the feed ports:
//!
//! - `codec`: binary packet decoding and segment codes
//! - `messages`: JSON subscribe/unsubscribe requests
//! - `websocket`: connection and session handling

pub mod codec;
pub mod messages;
pub mod websocket;

pub use codec::{CodecError, FeedPacket};
pub use websocket::{FeedConfig, WebSocketTransport};
