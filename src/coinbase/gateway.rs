//! [`ExchangeGateway`] backed by the Coinbase REST API and the
//! authenticated websocket `user` channel
//!
//! Orders go out over REST. Fills arrive as `match` messages on the `user`
//! channel, which only carries our own orders. A `heartbeat` subscription
//! rides along so a quiet account does not look like a dead socket.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::client::CoinbaseClient;
use super::websocket::{run_stream, FeedMessage, StreamConfig, StreamError, StreamHandler, Subscribe};
use crate::gateway::{
    ExchangeGateway, FillNotification, GatewayEvent, GatewayResult, PlaceAck, PlaceRequest,
};
use crate::types::Instrument;

const FILL_CHANNELS: [&str; 2] = ["user", "heartbeat"];

pub struct CoinbaseGateway {
    client: Arc<CoinbaseClient>,
    stream: StreamConfig,
    products: Vec<Instrument>,
}

impl CoinbaseGateway {
    /// `products` are the instruments whose fills are streamed
    pub fn new(client: Arc<CoinbaseClient>, stream: StreamConfig, products: Vec<Instrument>) -> Self {
        Self {
            client,
            stream,
            products,
        }
    }

    /// Venue minimum order size of every tradable product
    pub async fn product_min_sizes(&self) -> GatewayResult<HashMap<Instrument, Decimal>> {
        let products = self.client.get_products().await?;
        Ok(products
            .into_iter()
            .filter(|p| p.is_tradable())
            .filter_map(|p| p.base_min_size.map(|min| (p.id, min)))
            .collect())
    }
}

#[async_trait]
impl ExchangeGateway for CoinbaseGateway {
    async fn place_order(&self, request: &PlaceRequest) -> GatewayResult<PlaceAck> {
        self.client.place_order(request).await
    }

    async fn cancel_order(&self, order_id: &str) -> GatewayResult<()> {
        self.client.cancel_order(order_id).await
    }

    fn subscribe_fills(&self) -> mpsc::UnboundedReceiver<GatewayEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        if !self.stream.has_credentials() {
            let _ = tx.send(GatewayEvent::Error(
                "fill stream unavailable: API credentials are not configured".into(),
            ));
            return rx;
        }

        let subscribe = Subscribe::new(self.products.clone(), &FILL_CHANNELS);
        tokio::spawn(run_stream(self.stream.clone(), subscribe, FillStream::new(tx)));
        rx
    }
}

/// Forwards `match` messages from the `user` channel as fills
struct FillStream {
    fills: mpsc::UnboundedSender<GatewayEvent>,
}

impl FillStream {
    fn new(fills: mpsc::UnboundedSender<GatewayEvent>) -> Self {
        Self { fills }
    }

    fn emit(&self, event: GatewayEvent) -> ControlFlow<()> {
        match self.fills.send(event) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}

impl StreamHandler for FillStream {
    fn on_message(&mut self, message: FeedMessage) -> ControlFlow<()> {
        match message {
            FeedMessage::Match {
                product_id,
                maker_order_id,
                size,
                price,
                maker_fee_rate,
            } => {
                tracing::debug!(order_id = %maker_order_id, %size, %price, "Match received");
                self.emit(GatewayEvent::Match(FillNotification {
                    maker_order_id,
                    instrument: product_id,
                    size,
                    price: Some(price),
                    fee: maker_fee_rate.map(|rate| price * size * rate),
                }))
            }
            _ if self.fills.is_closed() => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        }
    }

    fn on_disconnect(&mut self, error: &StreamError) -> ControlFlow<()> {
        self.emit(GatewayEvent::Error(format!(
            "fill stream interrupted, fills during the gap are not replayed: {}",
            error
        )))
    }
}
