//! Coinbase Exchange integration
//!
//! REST client with request signing, rate limiting and a circuit breaker
//! for orders and the product catalogue. Book changes and fills stream over
//! the websocket feed with automatic reconnection.

pub mod auth;
pub mod client;
pub mod feed;
pub mod gateway;
pub mod types;
pub mod websocket;

pub use auth::Credentials;
pub use client::{ClientConfig, CoinbaseClient, API_BASE_URL, SANDBOX_BASE_URL};
pub use feed::{CoinbaseBookFeed, LocalBook};
pub use gateway::CoinbaseGateway;
pub use types::{NewOrder, OrderResponse, Product};
pub use websocket::{StreamConfig, StreamError, SANDBOX_WS_FEED_URL, WS_FEED_URL};
