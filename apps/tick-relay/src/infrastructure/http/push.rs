//! Push Channel
//!
//! One WebSocket per browser session. The session starts with an empty
//! interest set and a `hello` message describing the polling fallback;
//! the client then sends `subscribe`, `unsubscribe` or `set` requests and
//! receives `tick_update` messages for its instruments.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use super::SharedState;
use crate::domain::streaming::{InstrumentKey, PushMessage};
use crate::domain::subscription::SessionId;

/// Request sent by a push client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Add instruments.
    Subscribe {
        /// Instruments as `SEG:ID` or bare ids.
        instrument_keys: Vec<String>,
    },
    /// Remove instruments.
    Unsubscribe {
        /// Instruments as `SEG:ID` or bare ids.
        instrument_keys: Vec<String>,
    },
    /// Replace the interest set.
    Set {
        /// Instruments as `SEG:ID` or bare ids.
        instrument_keys: Vec<String>,
    },
}

pub(super) async fn push_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (session, mut ticks) = state.fanout.connect();
    let (mut sender, mut receiver) = socket.split();
    info!(session, "Push client connected");

    let hello = PushMessage::hello(&session.to_string(), &state.contract);
    if send(&mut sender, &hello).await {
        loop {
            tokio::select! {
                msg = receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = apply_request(&state, session, text.as_str()) {
                            if !send(&mut sender, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
                tick = ticks.recv() => match tick {
                    Some(event) => {
                        if !send(&mut sender, &PushMessage::TickUpdate(event)).await {
                            break;
                        }
                    }
                    // Pruned by the fan-out.
                    None => break,
                },
            }
        }
    }

    state.fanout.disconnect(session);
    info!(session, "Push client disconnected");
}

/// Apply one client request. Returns an error message to send back when
/// the request is malformed.
fn apply_request(state: &SharedState, session: SessionId, text: &str) -> Option<PushMessage> {
    let request: ClientRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            return Some(PushMessage::Error {
                message: format!("unrecognised request: {e}"),
            });
        }
    };

    let raw = match &request {
        ClientRequest::Subscribe { instrument_keys }
        | ClientRequest::Unsubscribe { instrument_keys }
        | ClientRequest::Set { instrument_keys } => instrument_keys,
    };
    let keys = match raw
        .iter()
        .map(|k| InstrumentKey::parse(k, &state.default_segment))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(keys) => keys,
        Err(e) => {
            return Some(PushMessage::Error {
                message: e.to_string(),
            });
        }
    };

    match request {
        ClientRequest::Subscribe { .. } => {
            state.fanout.add_interest(session, &keys);
        }
        ClientRequest::Unsubscribe { .. } => {
            state.fanout.remove_interest(session, &keys);
        }
        ClientRequest::Set { .. } => {
            state.fanout.set_interest(session, &keys);
        }
    }
    debug!(session, interest = state.fanout.interest_of(session).len(), "Push interest updated");
    None
}

/// Send one message. Returns `false` once the socket is gone.
async fn send(sender: &mut SplitSink<WebSocket, Message>, message: &PushMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            debug!(error = %e, "Failed to encode push message");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_requests_parse() {
        let request: ClientRequest =
            serde_json::from_str(r#"{"action":"set","instrument_keys":["NSE:1","2"]}"#).unwrap();
        assert_eq!(
            request,
            ClientRequest::Set {
                instrument_keys: vec!["NSE:1".to_string(), "2".to_string()]
            }
        );
        assert!(serde_json::from_str::<ClientRequest>(r#"{"action":"shout"}"#).is_err());
    }
}
