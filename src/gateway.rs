//! Exchange gateway seam
//!
//! The broker only talks to the venue through [`ExchangeGateway`]: order
//! placement, cancellation and a stream of private fill notifications.
//! [`crate::coinbase::CoinbaseGateway`] is the production implementation.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{Instrument, Side};

/// Failures of a gateway call
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// Venue refused the request itself (HTTP 400/404), e.g. the order is
    /// already done or unknown
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Any other non-success response
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("circuit breaker is open, rejecting request")]
    CircuitOpen,

    #[error("authentication error: {0}")]
    Auth(String),
}

impl GatewayError {
    /// Client-side rejection, as opposed to a transient failure
    pub fn is_bad_request(&self) -> bool {
        matches!(self, GatewayError::BadRequest(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Limit order to rest on the book
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceRequest {
    pub instrument: Instrument,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

/// Venue-side status reported when an order is accepted or declined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueStatus {
    Pending,
    Open,
    Active,
    Done,
    Rejected,
    #[serde(other)]
    Unknown,
}

/// Outcome of a successful placement call
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceAck {
    pub id: String,
    pub status: VenueStatus,
    pub reject_reason: Option<String>,
}

impl PlaceAck {
    pub fn accepted(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: VenueStatus::Pending,
            reject_reason: None,
        }
    }

    pub fn rejected(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: VenueStatus::Rejected,
            reject_reason: Some(reason.into()),
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.status == VenueStatus::Rejected
    }
}

/// A match against one of our resting orders
#[derive(Debug, Clone, PartialEq)]
pub struct FillNotification {
    pub maker_order_id: String,
    pub instrument: Instrument,
    pub size: Decimal,
    pub price: Option<Decimal>,
    pub fee: Option<Decimal>,
}

/// Items on the private fill stream
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Match(FillNotification),
    Error(String),
}

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Place a post-only limit order
    async fn place_order(&self, request: &PlaceRequest) -> GatewayResult<PlaceAck>;

    /// Cancel a resting order by venue id
    async fn cancel_order(&self, order_id: &str) -> GatewayResult<()>;

    /// Open a private fill stream. Every call opens a new stream.
    fn subscribe_fills(&self) -> mpsc::UnboundedReceiver<GatewayEvent>;
}
