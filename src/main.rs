//! Price chaser - main entry point
//!
//! This binary provides two subcommands:
//! - chase: keep orders at the best price until they fill
//! - products: list venue products and their minimum sizes

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use price_chaser::Side;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "price-chaser")]
#[command(about = "Keep resting limit orders at the best price on Coinbase Exchange", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Chase the configured orders until they fill or Ctrl+C
    Chase {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/chaser.json")]
        config: String,

        /// Ad-hoc order product (e.g. BTC-USD), needs --side and --size
        #[arg(long)]
        product: Option<String>,

        /// Ad-hoc order side: buy or sell
        #[arg(long)]
        side: Option<Side>,

        /// Ad-hoc order size in base currency
        #[arg(long)]
        size: Option<Decimal>,
    },

    /// List products with their minimum order sizes
    Products {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/chaser.json")]
        config: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy HTTP crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn,tungstenite=warn,tokio_tungstenite=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    // Websocket TLS needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        bail!("Failed to install rustls crypto provider");
    }

    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Chase { .. } => "chase",
        Commands::Products { .. } => "products",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Chase {
            config,
            product,
            side,
            size,
        } => commands::chase::run(config, product, side, size),

        Commands::Products { config } => commands::products::run(config),
    }
}
