//! Price Chaser
//!
//! Keeps resting post-only limit orders pinned to the best price of their
//! side of the book. When the best bid or ask moves away from an order, the
//! broker cancels it and places it again at the new price until it fills.
//!
//! The broker only depends on two seams:
//! - [`gateway::ExchangeGateway`]: place, cancel and a private fill stream
//! - [`feed::MarketDataFeed`]: per-instrument top-of-book changes
//!
//! [`coinbase`] implements both against Coinbase Exchange: REST for orders,
//! the websocket feed for book changes and fills.
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use price_chaser::coinbase::{
//!     ClientConfig, CoinbaseBookFeed, CoinbaseClient, CoinbaseGateway, Credentials, StreamConfig,
//! };
//! use price_chaser::{Broker, BrokerConfig, Instrument, Order, Side};
//! use rust_decimal_macros::dec;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let product = Instrument::new("BTC-USD");
//!     let credentials = Credentials::new("key", "c2VjcmV0", "passphrase");
//!     let client = Arc::new(CoinbaseClient::new(Some(credentials.clone()), ClientConfig::default())?);
//!     let stream = StreamConfig::default().with_credentials(Some(credentials));
//!     let gateway = CoinbaseGateway::new(client, stream.clone(), vec![product.clone()]);
//!     let feed = CoinbaseBookFeed::new(stream);
//!
//!     let mut broker = Broker::new(Arc::new(gateway), Arc::new(feed), BrokerConfig::default());
//!     broker.queue_order(Order::new(product, Side::Sell, dec!(0.5))?)?;
//!     broker.run();
//!     broker.serve().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod coinbase;
pub mod common;
pub mod config;
pub mod feed;
pub mod gateway;
pub mod order;
pub mod queue;
pub mod types;

pub use broker::{Broker, BrokerError, BrokerEvent, OrderRef};
pub use config::{BrokerConfig, Config};
pub use feed::{FeedEvent, MarketDataFeed};
pub use gateway::{ExchangeGateway, FillNotification, GatewayError, GatewayEvent, PlaceAck, PlaceRequest};
pub use order::{Order, OrderError, OrderStatus};
pub use queue::OrderQueue;
pub use types::*;
