//! Coinbase Exchange request and response models

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::gateway::{PlaceAck, PlaceRequest, VenueStatus};
use crate::types::{Instrument, Side};

/// Body of `POST /orders`
#[derive(Debug, Clone, Serialize)]
pub struct NewOrder {
    pub product_id: Instrument,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: &'static str,
    pub price: String,
    pub size: String,
    pub time_in_force: &'static str,
    pub post_only: bool,
}

impl NewOrder {
    /// Good-till-cancelled limit order that only adds liquidity
    pub fn post_only_limit(request: &PlaceRequest) -> Self {
        Self {
            product_id: request.instrument.clone(),
            side: request.side,
            order_type: "limit",
            price: request.price.normalize().to_string(),
            size: request.size.normalize().to_string(),
            time_in_force: "GTC",
            post_only: true,
        }
    }
}

/// Order as returned by `POST /orders`
#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub id: String,
    pub status: VenueStatus,
    #[serde(default)]
    pub reject_reason: Option<String>,
    #[serde(default)]
    pub product_id: Option<Instrument>,
}

impl From<OrderResponse> for PlaceAck {
    fn from(response: OrderResponse) -> Self {
        PlaceAck {
            id: response.id,
            status: response.status,
            reject_reason: response.reject_reason,
        }
    }
}

/// Entry of `GET /products`
#[derive(Debug, Clone, Deserialize)]
pub struct Product {
    pub id: Instrument,
    pub base_min_size: Option<Decimal>,
    pub quote_increment: Decimal,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub trading_disabled: bool,
}

impl Product {
    pub fn is_tradable(&self) -> bool {
        !self.trading_disabled && self.status.as_deref().map_or(true, |s| s == "online")
    }
}

/// Error body returned with non-2xx responses
#[derive(Debug, Clone, Deserialize)]
pub struct ApiMessage {
    pub message: String,
}
