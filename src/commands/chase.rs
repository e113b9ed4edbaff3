//! Chase Command
//!
//! Queues the configured orders (plus an optional ad-hoc one), runs the
//! broker against Coinbase and logs every lifecycle event until Ctrl+C.

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use price_chaser::coinbase::{CoinbaseBookFeed, CoinbaseClient, CoinbaseGateway, StreamConfig};
use price_chaser::{Broker, BrokerConfig, BrokerEvent, Config, Instrument, Order, Side};

pub fn run(
    config_path: String,
    product: Option<String>,
    side: Option<Side>,
    size: Option<Decimal>,
) -> Result<()> {
    dotenv::dotenv().ok();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config_path, product, side, size))
}

async fn run_async(
    config_path: String,
    product: Option<String>,
    side: Option<Side>,
    size: Option<Decimal>,
) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    let orders = collect_orders(&config, product, side, size)?;
    let products = unique_products(&orders);

    let mode = if config.exchange.sandbox {
        "SANDBOX"
    } else {
        "PRODUCTION"
    };
    info!("Price chaser starting ({} mode)", mode);
    info!("Products: {}", products.iter().map(Instrument::as_str).collect::<Vec<_>>().join(", "));
    info!("Orders: {}", orders.len());

    let client = Arc::new(
        CoinbaseClient::from_config(&config.exchange).context("Failed to create Coinbase client")?,
    );
    if !client.has_credentials() {
        bail!("Chasing orders requires COINBASE_API_KEY, COINBASE_API_SECRET and COINBASE_API_PASSPHRASE");
    }

    let stream = StreamConfig::from_exchange_config(&config.exchange);
    info!("Streaming from {}", stream.url);
    let gateway = CoinbaseGateway::new(Arc::clone(&client), stream.clone(), products.clone());
    let feed = CoinbaseBookFeed::new(stream);

    let broker_config = with_venue_min_sizes(config.broker.clone(), &gateway, &products).await;

    let mut broker = Broker::new(Arc::new(gateway), Arc::new(feed), broker_config);
    let events = broker.subscribe();
    tokio::spawn(log_events(events));

    for order in orders {
        let slot = broker.queue_order(order)?;
        debug!(instrument = %slot.instrument(), slot = slot.index(), "Queued");
    }
    broker.run();

    tokio::select! {
        _ = broker.serve() => {
            warn!("Broker event loop ended");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down");
            warn!("Resting orders are left on the book");
        }
    }

    info!("Price chaser stopped");
    Ok(())
}

fn collect_orders(
    config: &Config,
    product: Option<String>,
    side: Option<Side>,
    size: Option<Decimal>,
) -> Result<Vec<Order>> {
    let mut orders = config
        .orders
        .iter()
        .map(|o| o.to_order())
        .collect::<Result<Vec<_>>>()?;

    match (product, side, size) {
        (Some(product), Some(side), Some(size)) => {
            let order = Order::new(Instrument::new(product.to_uppercase()), side, size)
                .context("Invalid ad-hoc order")?;
            orders.push(order);
        }
        (None, None, None) => {}
        _ => bail!("--product, --side and --size must be given together"),
    }

    if orders.is_empty() {
        bail!("No orders to chase: add entries under \"orders\" or pass --product/--side/--size");
    }
    Ok(orders)
}

fn unique_products(orders: &[Order]) -> Vec<Instrument> {
    let mut products: Vec<Instrument> = Vec::new();
    for order in orders {
        if !products.contains(order.instrument()) {
            products.push(order.instrument().clone());
        }
    }
    products
}

/// Fill in venue minimum sizes for products the config leaves unset
async fn with_venue_min_sizes(
    mut config: BrokerConfig,
    gateway: &CoinbaseGateway,
    products: &[Instrument],
) -> BrokerConfig {
    match gateway.product_min_sizes().await {
        Ok(venue) => {
            for product in products {
                if config.min_sizes.contains_key(product) {
                    continue;
                }
                match venue.get(product) {
                    Some(&min) => {
                        info!(%product, min_size = %min, "Using venue minimum size");
                        config = config.with_min_size(product.clone(), min);
                    }
                    None => warn!(%product, "Product not listed as tradable by the venue"),
                }
            }
        }
        Err(e) => warn!("Could not load product catalogue, using configured minimum sizes: {}", e),
    }
    config
}

async fn log_events(mut events: broadcast::Receiver<BrokerEvent>) {
    loop {
        match events.recv().await {
            Ok(BrokerEvent::Error(message)) => debug!("Broker error event: {}", message),
            Ok(event) => {
                if let Some(order) = event.order() {
                    info!(
                        event = event.kind(),
                        instrument = %order.instrument(),
                        side = %order.side(),
                        price = %order.price(),
                        remaining = %order.remaining(),
                        fee = %order.fee(),
                        status = %order.status(),
                        id = order.id().unwrap_or("-"),
                        "Order event"
                    );
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!("Event logger lagged, {} events skipped", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}
