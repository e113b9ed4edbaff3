//! Order record and its lifecycle state machine
//!
//! An order is created by the caller in `Created` and from then on is only
//! mutated by the broker's dispatch logic and by gateway call completions.
//! All setters validate their input and never touch the network.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::gateway::PlaceRequest;
use crate::types::{Instrument, Side, SIZE_DECIMALS};

/// Validation errors raised by order mutators
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OrderError {
    #[error("invalid order status '{0}'")]
    InvalidStatus(String),

    #[error("price must be positive, got {0}")]
    NonPositivePrice(Decimal),

    #[error("size must be positive, got {0}")]
    NonPositiveSize(Decimal),

    #[error("order id must not be empty")]
    EmptyId,

    #[error("remaining {remaining} outside [0, {original}]")]
    RemainingOutOfRange { remaining: Decimal, original: Decimal },
}

/// Order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Not yet quoted; the next book change places it
    Created,
    /// A place or cancel call is in flight for this order
    Ready,
    /// Resting on the venue
    Placed,
    /// Venue declined the placement; reset to `Created` right away
    Rejected,
    /// Venue confirmed cancellation of the resting order
    Cancelled,
    /// Remaining size fell below the venue minimum
    Filled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 6] = [
        OrderStatus::Created,
        OrderStatus::Ready,
        OrderStatus::Placed,
        OrderStatus::Rejected,
        OrderStatus::Cancelled,
        OrderStatus::Filled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Ready => "ready",
            OrderStatus::Placed => "placed",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Filled => "filled",
        }
    }

    /// `Ready` doubles as the per-order in-flight guard: while it is held,
    /// book changes leave the order alone.
    pub fn is_locked(&self) -> bool {
        matches!(self, OrderStatus::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| OrderError::InvalidStatus(s.to_string()))
    }
}

/// One trading intent and its venue-side state.
///
/// Built only through [`Order::new`] and the validating setters, so the
/// record can be serialized for observers but never decoded.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    instrument: Instrument,
    side: Side,
    original_size: Decimal,
    remaining: Decimal,
    price: Decimal,
    fee: Decimal,
    status: OrderStatus,
    id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a new unquoted order
    pub fn new(instrument: Instrument, side: Side, size: Decimal) -> Result<Self, OrderError> {
        if size <= Decimal::ZERO {
            return Err(OrderError::NonPositiveSize(size));
        }
        let now = Utc::now();
        Ok(Self {
            instrument,
            side,
            original_size: size,
            remaining: size,
            price: Decimal::ZERO,
            fee: Decimal::ZERO,
            status: OrderStatus::Created,
            id: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn original_size(&self) -> Decimal {
        self.original_size
    }

    pub fn remaining(&self) -> Decimal {
        self.remaining
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    pub fn fee(&self) -> Decimal {
        self.fee
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn set_status(&mut self, status: OrderStatus) {
        self.status = status;
        self.touch();
    }

    pub fn set_price(&mut self, price: Decimal) -> Result<(), OrderError> {
        if price <= Decimal::ZERO {
            return Err(OrderError::NonPositivePrice(price));
        }
        self.price = price;
        self.touch();
        Ok(())
    }

    /// Record the venue-assigned id. A cancel-replace gets a fresh id from
    /// the venue, so this overwrites the previous one.
    pub fn set_id(&mut self, id: impl Into<String>) -> Result<(), OrderError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(OrderError::EmptyId);
        }
        self.id = Some(id);
        self.touch();
        Ok(())
    }

    pub fn set_remaining(&mut self, remaining: Decimal) -> Result<(), OrderError> {
        if remaining < Decimal::ZERO || remaining > self.original_size {
            return Err(OrderError::RemainingOutOfRange {
                remaining,
                original: self.original_size,
            });
        }
        self.remaining = remaining;
        self.touch();
        Ok(())
    }

    pub fn add_fee(&mut self, fee: Decimal) {
        self.fee += fee;
        self.touch();
    }

    /// Subtract a matched size, rounding to [`SIZE_DECIMALS`] places so
    /// repeated partial fills do not drift.
    pub fn reduce_remaining(&mut self, matched: Decimal) -> Result<Decimal, OrderError> {
        if matched <= Decimal::ZERO {
            return Err(OrderError::NonPositiveSize(matched));
        }
        let remaining = (self.remaining - matched).round_dp(SIZE_DECIMALS);
        self.set_remaining(remaining)?;
        Ok(remaining)
    }

    /// Gateway request for the order at its current price and remaining size
    pub fn place_request(&self) -> PlaceRequest {
        PlaceRequest {
            instrument: self.instrument.clone(),
            side: self.side,
            price: self.price,
            size: self.remaining,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}/{} @ {} [{}]",
            self.instrument,
            self.side,
            self.remaining,
            self.original_size,
            self.price,
            self.status
        )?;
        if let Some(id) = &self.id {
            write!(f, " id={}", id)?;
        }
        Ok(())
    }
}
