//! WebSocket Feed Transport
//!
//! Opens one WebSocket connection per [`FeedSession`]. Credentials travel as
//! query parameters; subscriptions are JSON requests and ticks arrive as
//! binary packets.
//!
//! A session remembers which [`InstrumentKey`] each `(segment, security id)`
//! pair was subscribed under, so ticks are reported with the caller's own
//! key (`NSE:1` rather than the wire name `NSE_EQ`).

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use super::codec::{self, FeedPacket};
use super::messages::{FeedRequest, InstrumentRef, RequestCode};
use crate::application::ports::{FeedSession, TransportError, UpstreamTick, UpstreamTransport};
use crate::domain::streaming::InstrumentKey;
use crate::infrastructure::config::Credentials;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Feed API version sent with every connection.
const FEED_VERSION: &str = "2";

/// Connection settings for the feed.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Base WebSocket URL.
    pub url: String,
    /// Account credentials.
    pub credentials: Credentials,
    /// Silence after which the connection is considered dead. The server
    /// pings every few seconds, so this only fires on a broken link.
    pub idle_timeout: Duration,
}

impl FeedConfig {
    /// Full connection URL including credentials.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Connect` if the base URL is invalid.
    pub fn connection_url(&self) -> Result<reqwest::Url, TransportError> {
        reqwest::Url::parse_with_params(
            &self.url,
            &[
                ("version", FEED_VERSION),
                ("token", self.credentials.access_token()),
                ("clientId", self.credentials.client_id()),
                ("authType", "2"),
            ],
        )
        .map_err(|e| TransportError::Connect(format!("invalid feed URL: {e}")))
    }
}

/// Transport that dials the feed over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    config: FeedConfig,
}

impl WebSocketTransport {
    /// Create a transport.
    #[must_use]
    pub const fn new(config: FeedConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl UpstreamTransport for WebSocketTransport {
    async fn connect(&self) -> Result<Box<dyn FeedSession>, TransportError> {
        let url = self.config.connection_url()?;
        debug!(host = url.host_str().unwrap_or_default(), "Connecting to feed");

        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (write, read) = ws.split();
        info!("Feed connection established");

        Ok(Box::new(WebSocketSession {
            write,
            read,
            pending: VecDeque::new(),
            subscribed: HashMap::new(),
            idle_timeout: self.config.idle_timeout,
        }))
    }
}

/// One live feed connection.
pub struct WebSocketSession {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    pending: VecDeque<UpstreamTick>,
    subscribed: HashMap<(u8, u32), InstrumentKey>,
    idle_timeout: Duration,
}

impl std::fmt::Debug for WebSocketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSession")
            .field("subscribed", &self.subscribed.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// Wire identity of a key, or `None` (logged) if the feed cannot carry it.
fn wire_ref(key: &InstrumentKey) -> Option<((u8, u32), InstrumentRef)> {
    let resolved = codec::segment_code(key.segment()).and_then(|segment| {
        let id = codec::security_id(key.security_id())?;
        Ok(((segment, id), InstrumentRef::from_key(key)?))
    });
    match resolved {
        Ok(resolved) => Some(resolved),
        Err(e) => {
            warn!(instrument = %key, error = %e, "Instrument not representable on feed, skipping");
            None
        }
    }
}

impl WebSocketSession {
    async fn send_requests(&mut self, requests: Vec<FeedRequest>) -> Result<(), TransportError> {
        for request in requests {
            let json = request
                .to_json()
                .map_err(|e| TransportError::Protocol(format!("failed to encode request: {e}")))?;
            self.write
                .send(Message::Text(json.into()))
                .await
                .map_err(|e| TransportError::Closed(e.to_string()))?;
        }
        Ok(())
    }

    /// Turn decoded packets into ticks queued for `next_tick`.
    fn accept_packets(&mut self, packets: Vec<FeedPacket>) -> Result<(), TransportError> {
        for packet in packets {
            match packet {
                FeedPacket::Price {
                    segment,
                    security_id,
                    price,
                    traded_at,
                } => match self.subscribed.get(&(segment, security_id)) {
                    Some(instrument) => self.pending.push_back(UpstreamTick {
                        instrument: instrument.clone(),
                        price,
                        traded_at,
                    }),
                    None => trace!(segment, security_id, "Tick for unsubscribed instrument"),
                },
                FeedPacket::Disconnect { reason } => {
                    return Err(TransportError::Closed(format!(
                        "server disconnect, reason {reason}"
                    )));
                }
                FeedPacket::Ignored { code } => trace!(code, "Ignoring feed packet"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FeedSession for WebSocketSession {
    async fn subscribe(&mut self, instruments: &[InstrumentKey]) -> Result<(), TransportError> {
        let mut refs = Vec::with_capacity(instruments.len());
        for key in instruments {
            if let Some((wire, reference)) = wire_ref(key) {
                self.subscribed.insert(wire, key.clone());
                refs.push(reference);
            }
        }
        debug!(count = refs.len(), "Subscribing instruments");
        self.send_requests(FeedRequest::batched(RequestCode::SubscribeTicker, &refs))
            .await
    }

    async fn unsubscribe(&mut self, instruments: &[InstrumentKey]) -> Result<(), TransportError> {
        let mut refs = Vec::with_capacity(instruments.len());
        for key in instruments {
            if let Some((wire, reference)) = wire_ref(key) {
                self.subscribed.remove(&wire);
                refs.push(reference);
            }
        }
        debug!(count = refs.len(), "Unsubscribing instruments");
        self.send_requests(FeedRequest::batched(RequestCode::UnsubscribeTicker, &refs))
            .await
    }

    async fn next_tick(&mut self) -> Result<Option<UpstreamTick>, TransportError> {
        loop {
            if let Some(tick) = self.pending.pop_front() {
                return Ok(Some(tick));
            }

            let frame = tokio::time::timeout(self.idle_timeout, self.read.next())
                .await
                .map_err(|_| TransportError::Timeout(self.idle_timeout))?;

            match frame {
                Some(Ok(Message::Binary(data))) => {
                    let packets = codec::decode_frame(&data)
                        .map_err(|e| TransportError::Protocol(e.to_string()))?;
                    self.accept_packets(packets)?;
                }
                Some(Ok(Message::Text(text))) => {
                    debug!(message = %text.as_str(), "Feed text message");
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Feed sent close frame");
                    return Ok(None);
                }
                // Pongs are queued by tungstenite; pings and pongs only reset the idle timer.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Closed(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        if let Ok(json) = FeedRequest::disconnect().to_json() {
            let _ = self.write.send(Message::Text(json.into())).await;
        }
        let _ = self.write.close().await;
        self.subscribed.clear();
        self.pending.clear();
    }
}
