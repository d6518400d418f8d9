//! REST Quote Client
//!
//! Batched last-traded-price lookups used as the bulk read fallback.
//!
//! # Wire Format
//!
//! ```text
//! POST {base}/marketfeed/ltp
//! {"NSE_EQ":[1,2]}
//!
//! {"status":"success","data":{"NSE_EQ":{"1":{"last_price":101.5}}}}
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::application::ports::{QuoteSource, QuoteSourceError};
use crate::domain::streaming::InstrumentKey;
use crate::infrastructure::config::Credentials;
use crate::infrastructure::upstream::codec;

const LTP_PATH: &str = "/marketfeed/ltp";

/// Longest error body kept in `QuoteSourceError::Status`.
const MAX_ERROR_BODY: usize = 512;

/// Request body keyed by canonical segment, plus the reverse index from
/// `(segment, id)` back to the caller's keys.
type LtpRequest = (
    BTreeMap<&'static str, Vec<u32>>,
    HashMap<(String, String), Vec<InstrumentKey>>,
);

#[derive(Debug, Deserialize)]
struct LtpResponse {
    status: String,
    #[serde(default)]
    data: HashMap<String, HashMap<String, LtpEntry>>,
}

#[derive(Debug, Deserialize)]
struct LtpEntry {
    last_price: f64,
}

/// HTTP client for the quote endpoint.
#[derive(Clone)]
pub struct LtpClient {
    client: Client,
    base_url: String,
}

impl std::fmt::Debug for LtpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LtpClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl LtpClient {
    /// Create a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `QuoteSourceError::Request` if the credentials are not valid
    /// header values or the client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Self, QuoteSourceError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert("access-token", header_value(credentials.access_token())?);
        headers.insert("client-id", header_value(credentials.client_id())?);

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .default_headers(headers)
            .build()
            .map_err(|e| QuoteSourceError::Request(format!("failed to build client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue, QuoteSourceError> {
    let mut header = HeaderValue::from_str(value)
        .map_err(|_| QuoteSourceError::Request("credential is not a valid header".to_string()))?;
    header.set_sensitive(true);
    Ok(header)
}

fn build_request(instruments: &[InstrumentKey]) -> LtpRequest {
    let mut body: BTreeMap<&'static str, Vec<u32>> = BTreeMap::new();
    let mut index: HashMap<(String, String), Vec<InstrumentKey>> = HashMap::new();

    for key in instruments {
        let wire = codec::segment_code(key.segment()).and_then(|code| {
            let id = codec::security_id(key.security_id())?;
            let name = codec::segment_name(code)
                .ok_or_else(|| codec::CodecError::UnknownSegment(key.segment().to_string()))?;
            Ok((name, id))
        });
        let (segment, id) = match wire {
            Ok(wire) => wire,
            Err(e) => {
                debug!(instrument = %key, error = %e, "Instrument not quotable, skipping");
                continue;
            }
        };

        let ids = body.entry(segment).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
        index
            .entry((segment.to_string(), id.to_string()))
            .or_default()
            .push(key.clone());
    }
    (body, index)
}

fn parse_response(
    response: LtpResponse,
    index: &HashMap<(String, String), Vec<InstrumentKey>>,
) -> Result<HashMap<InstrumentKey, Decimal>, QuoteSourceError> {
    if response.status != "success" {
        return Err(QuoteSourceError::Decode(format!(
            "unexpected status {}",
            response.status
        )));
    }

    let mut prices = HashMap::new();
    for (segment, entries) in response.data {
        for (id, entry) in entries {
            let Some(keys) = index.get(&(segment.clone(), id)) else {
                continue;
            };
            let Some(price) = to_decimal(entry.last_price) else {
                warn!(segment = %segment, "Quote with unusable price, skipping");
                continue;
            };
            for key in keys {
                prices.insert(key.clone(), price);
            }
        }
    }
    Ok(prices)
}

fn to_decimal(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    value.to_string().parse().ok()
}

#[async_trait]
impl QuoteSource for LtpClient {
    async fn fetch_quotes(
        &self,
        instruments: &[InstrumentKey],
    ) -> Result<HashMap<InstrumentKey, Decimal>, QuoteSourceError> {
        let (body, index) = build_request(instruments);
        if body.is_empty() {
            return Ok(HashMap::new());
        }

        let response = self
            .client
            .post(format!("{}{LTP_PATH}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| QuoteSourceError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut text = response.text().await.unwrap_or_default();
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(QuoteSourceError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: LtpResponse = response
            .json()
            .await
            .map_err(|e| QuoteSourceError::Decode(e.to_string()))?;
        let prices = parse_response(parsed, &index)?;
        debug!(requested = instruments.len(), returned = prices.len(), "Fetched quotes");
        Ok(prices)
    }
}
