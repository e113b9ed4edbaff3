//! Products Command
//!
//! Lists venue products with their minimum order size and price increment.

use anyhow::{Context, Result};
use tracing::info;

use price_chaser::coinbase::CoinbaseClient;
use price_chaser::Config;

pub fn run(config_path: String) -> Result<()> {
    dotenv::dotenv().ok();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config_path))
}

async fn run_async(config_path: String) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    let client =
        CoinbaseClient::from_config(&config.exchange).context("Failed to create Coinbase client")?;
    info!("Fetching products from {}", client.base_url());

    let mut products = client
        .get_products()
        .await
        .context("Failed to fetch products")?;
    products.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));

    println!("\n{}", "=".repeat(60));
    println!("{:<16} {:>16} {:>14} {:>10}", "PRODUCT", "MIN SIZE", "TICK", "STATUS");
    println!("{}", "-".repeat(60));
    for product in &products {
        let min_size = product
            .base_min_size
            .map(|m| m.normalize().to_string())
            .unwrap_or_else(|| "-".to_string());
        let status = if product.is_tradable() {
            "online"
        } else {
            "disabled"
        };
        println!(
            "{:<16} {:>16} {:>14} {:>10}",
            product.id.as_str(),
            min_size,
            product.quote_increment.normalize().to_string(),
            status
        );
    }
    println!("{}", "=".repeat(60));
    println!("  {} products\n", products.len());

    Ok(())
}
