//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::order::Order;
use crate::types::{Instrument, Side};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Orders to chase on startup
    #[serde(default)]
    pub orders: Vec<OrderConfig>,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.exchange.load_credentials_from_env();
        Ok(config)
    }
}

/// Exchange connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Trade against the public sandbox instead of production
    pub sandbox: bool,
    /// Requests per second allowed by the client
    pub rate_limit: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Websocket endpoint override, e.g. for a local relay
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,
    /// First reconnect delay, doubled on every failed attempt
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// Reconnect when a stream is silent this long
    pub stale_after_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            passphrase: None,
            sandbox: true,
            rate_limit: 5,
            timeout_secs: 30,
            max_retries: 3,
            websocket_url: None,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            stale_after_secs: 10,
        }
    }
}

impl ExchangeConfig {
    /// Override credentials with `COINBASE_API_KEY`, `COINBASE_API_SECRET`
    /// and `COINBASE_API_PASSPHRASE` when they are set
    pub fn load_credentials_from_env(&mut self) {
        if let Ok(api_key) = std::env::var("COINBASE_API_KEY") {
            self.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("COINBASE_API_SECRET") {
            self.api_secret = Some(api_secret);
        }
        if let Ok(passphrase) = std::env::var("COINBASE_API_PASSPHRASE") {
            self.passphrase = Some(passphrase);
        }
    }
}

/// Broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Minimum tradable size used when a product has no explicit entry
    #[serde(default = "default_min_size")]
    pub default_min_size: Decimal,
    /// Per-product minimum tradable size
    #[serde(default)]
    pub min_sizes: HashMap<Instrument, Decimal>,
    /// Buffered lifecycle events per subscriber
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_min_size() -> Decimal {
    dec!(0.01)
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            default_min_size: default_min_size(),
            min_sizes: HashMap::new(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl BrokerConfig {
    pub fn min_size(&self, instrument: &Instrument) -> Decimal {
        self.min_sizes
            .get(instrument)
            .copied()
            .unwrap_or(self.default_min_size)
    }

    pub fn with_min_size(mut self, instrument: Instrument, size: Decimal) -> Self {
        self.min_sizes.insert(instrument, size);
        self
    }
}

/// One order to chase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfig {
    pub product: Instrument,
    pub side: Side,
    pub size: Decimal,
}

impl OrderConfig {
    pub fn to_order(&self) -> Result<Order> {
        Order::new(self.product.clone(), self.side, self.size)
            .with_context(|| format!("Invalid order for {}", self.product))
    }
}
