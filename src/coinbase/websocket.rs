//! Coinbase Exchange websocket feed
//!
//! A stream sends one `subscribe` message per connection and hands every
//! decoded message to a [`StreamHandler`]. When the socket drops, goes
//! quiet for longer than `stale_after` or the venue answers with an error,
//! the handler hears about it and the stream reconnects after an
//! exponential backoff.

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::auth::Credentials;
use crate::config::ExchangeConfig;
use crate::types::{Instrument, Side};

/// Production websocket endpoint
pub const WS_FEED_URL: &str = "wss://ws-feed.exchange.coinbase.com";

/// Public sandbox websocket endpoint
pub const SANDBOX_WS_FEED_URL: &str = "wss://ws-feed-public.sandbox.exchange.coinbase.com";

/// Path signed to authenticate a subscription
const VERIFY_PATH: &str = "/users/self/verify";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StreamError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("no message received for {0:?}")]
    Stale(Duration),

    #[error("venue error: {0}")]
    Venue(String),

    #[error("cannot sign subscription: {0}")]
    Auth(String),
}

/// Connection settings shared by the book and fill streams
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    /// Signs every subscription when present. The `user` channel needs it.
    pub credentials: Option<Credentials>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Reconnect when nothing arrives for this long. Heartbeats arrive
    /// every second on a healthy connection.
    pub stale_after: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: SANDBOX_WS_FEED_URL.to_string(),
            credentials: None,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            stale_after: Duration::from_secs(10),
        }
    }
}

impl StreamConfig {
    pub fn from_exchange_config(config: &ExchangeConfig) -> Self {
        let url = match &config.websocket_url {
            Some(url) => url.as_str(),
            None if config.sandbox => SANDBOX_WS_FEED_URL,
            None => WS_FEED_URL,
        };
        let credentials = Credentials::from_parts(
            config.api_key.as_deref(),
            config.api_secret.as_deref(),
            config.passphrase.as_deref(),
        )
        .ok();
        Self::default()
            .with_url(url)
            .with_credentials(credentials)
            .with_backoff(
                Duration::from_millis(config.reconnect_initial_ms),
                Duration::from_millis(config.reconnect_max_ms),
            )
            .with_stale_after(Duration::from_secs(config.stale_after_secs))
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial.max(Duration::from_millis(1));
        self.max_backoff = max.max(self.initial_backoff);
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after.max(Duration::from_secs(1));
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }
}

/// Exponential reconnect backoff: initial, 2x, 4x... capped at max
#[derive(Debug)]
pub struct ReconnectPolicy {
    initial_backoff: Duration,
    max_backoff: Duration,
    current_attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            current_attempt: 0,
        }
    }

    pub fn next_backoff(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.current_attempt);
        self.current_attempt = self.current_attempt.saturating_add(1);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Back to the initial delay once a connection is confirmed
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

/// Authentication fields of a signed subscription
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscribeAuth {
    pub key: String,
    pub passphrase: String,
    pub timestamp: String,
    pub signature: String,
}

/// Outgoing `subscribe` message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscribe {
    #[serde(rename = "type")]
    kind: &'static str,
    pub product_ids: Vec<Instrument>,
    pub channels: Vec<&'static str>,
    #[serde(flatten)]
    pub auth: Option<SubscribeAuth>,
}

impl Subscribe {
    pub fn new(product_ids: Vec<Instrument>, channels: &[&'static str]) -> Self {
        Self {
            kind: "subscribe",
            product_ids,
            channels: channels.to_vec(),
            auth: None,
        }
    }

    /// Attach a signature over `timestamp + GET + /users/self/verify`
    pub fn signed(mut self, credentials: &Credentials, timestamp: &str) -> Result<Self, StreamError> {
        let signature = credentials
            .sign(timestamp, "GET", VERIFY_PATH, "")
            .map_err(|e| StreamError::Auth(e.to_string()))?;
        self.auth = Some(SubscribeAuth {
            key: credentials.api_key().to_string(),
            passphrase: credentials.passphrase().to_string(),
            timestamp: timestamp.to_string(),
            signature,
        });
        Ok(self)
    }
}

/// Incoming messages, keyed on `type`. Anything not listed decodes to
/// [`FeedMessage::Other`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    Subscriptions {},
    /// Full level-2 book, sent once per subscription
    Snapshot {
        product_id: Instrument,
        #[serde(default)]
        bids: Vec<(Decimal, Decimal)>,
        #[serde(default)]
        asks: Vec<(Decimal, Decimal)>,
    },
    /// `[side, price, new size]` per changed level. Size zero removes it.
    #[serde(rename = "l2update")]
    L2Update {
        product_id: Instrument,
        changes: Vec<(Side, Decimal, Decimal)>,
    },
    Heartbeat {
        product_id: Instrument,
    },
    /// Trade between a resting maker order and a taker
    Match {
        product_id: Instrument,
        maker_order_id: String,
        size: Decimal,
        price: Decimal,
        /// Present on the `user` channel when our order made
        #[serde(default)]
        maker_fee_rate: Option<Decimal>,
    },
    Error {
        message: String,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// Consumer of one stream's messages
pub trait StreamHandler: Send {
    /// `Break` ends the stream for good
    fn on_message(&mut self, message: FeedMessage) -> ControlFlow<()>;

    /// Called before every reconnect
    fn on_disconnect(&mut self, error: &StreamError) -> ControlFlow<()>;
}

/// Keep `subscribe` open against `config.url` until the handler breaks
pub async fn run_stream<H: StreamHandler>(config: StreamConfig, subscribe: Subscribe, mut handler: H) {
    let mut reconnect = ReconnectPolicy::new(config.initial_backoff, config.max_backoff);

    loop {
        let error = match run_session(&config, &subscribe, &mut handler, &mut reconnect).await {
            Ok(()) => break,
            Err(e) => e,
        };
        warn!(url = %config.url, error = %error, "Websocket session ended");
        if handler.on_disconnect(&error).is_break() {
            break;
        }

        let backoff = reconnect.next_backoff();
        info!(
            backoff_ms = backoff.as_millis() as u64,
            attempt = reconnect.current_attempt(),
            "Reconnecting websocket"
        );
        sleep(backoff).await;
    }

    debug!(url = %config.url, channels = ?subscribe.channels, "Websocket stream closed");
}

async fn run_session<H: StreamHandler>(
    config: &StreamConfig,
    subscribe: &Subscribe,
    handler: &mut H,
    reconnect: &mut ReconnectPolicy,
) -> Result<(), StreamError> {
    let request = match &config.credentials {
        Some(credentials) => {
            let timestamp = chrono::Utc::now().timestamp().to_string();
            subscribe.clone().signed(credentials, &timestamp)?
        }
        None => subscribe.clone(),
    };
    let request = serde_json::to_string(&request).map_err(|e| StreamError::Send(e.to_string()))?;

    let (ws_stream, _) = connect_async(config.url.as_str())
        .await
        .map_err(|e| StreamError::Connect(e.to_string()))?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(request.into()))
        .await
        .map_err(|e| StreamError::Send(e.to_string()))?;
    debug!(url = %config.url, channels = ?subscribe.channels, "Subscription sent");

    loop {
        let frame = match timeout(config.stale_after, read.next()).await {
            Err(_) => return Err(StreamError::Stale(config.stale_after)),
            Ok(None) => return Err(StreamError::Closed("stream ended".into())),
            Ok(Some(Err(e))) => return Err(StreamError::Closed(e.to_string())),
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                let message = match serde_json::from_str::<FeedMessage>(text.as_str()) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Skipping undecodable websocket message");
                        continue;
                    }
                };
                match message {
                    FeedMessage::Subscriptions {} => {
                        reconnect.reset();
                        info!(url = %config.url, channels = ?subscribe.channels, "Websocket subscribed");
                    }
                    FeedMessage::Error { message, reason } => {
                        let reason = reason.map(|r| format!(" ({})", r)).unwrap_or_default();
                        return Err(StreamError::Venue(format!("{}{}", message, reason)));
                    }
                    message => {
                        if handler.on_message(message).is_break() {
                            return Ok(());
                        }
                    }
                }
            }
            Message::Ping(payload) => {
                write
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|e| StreamError::Send(e.to_string()))?;
            }
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed by venue".to_string());
                return Err(StreamError::Closed(reason));
            }
            _ => {}
        }
    }
}
