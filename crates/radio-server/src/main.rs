//! Main entry point for the broker server.

use anyhow::Result;
use clap::{Arg, Command};
use radio_server::{config::ServerConfig, http::start_server};
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let matches = Command::new("radio-server")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Radio Team")
        .about("Radio Broker - verifies signed service offers and correlates job results")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to configuration file")
                .default_value("radio-config.toml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .help("Generate a default configuration file and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .help("Enable debug logging, including inbound payloads")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    // Initialize tracing
    let default_level = if matches.get_flag("debug") { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("radio-config.toml");

    // Handle config generation
    if matches.get_flag("generate-config") {
        return generate_config(config_path);
    }

    info!("Starting Radio Broker v{}", env!("CARGO_PKG_VERSION"));
    info!("Loading configuration from: {}", config_path);

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("Use --generate-config to create a default configuration file");
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!("Configuration loaded and validated successfully");
    info!("Server will bind to: {}:{}", config.http.bind_address, config.http.port);
    info!("Dispatch mode: {:?}", config.broker.dispatch.mode);
    info!("Binary results stored in: {}", config.broker.storage.blob_dir.display());

    if let Err(e) = start_server(&config).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Load configuration from file
fn load_config(path: &str) -> Result<ServerConfig> {
    if !Path::new(path).exists() {
        return Err(anyhow::anyhow!(
            "Configuration file '{}' not found. Use --generate-config to create one.",
            path
        ));
    }

    ServerConfig::from_file(path).map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))
}

/// Generate a default configuration file
fn generate_config(path: &str) -> Result<()> {
    let config = ServerConfig::default();

    config.save_to_file(path)?;

    println!("Generated default configuration file: {}", path);
    println!();
    println!("Settings worth reviewing before running the server:");
    println!("1. broker.dispatch: `reply` answers offers directly, `forward` also POSTs to worker_url");
    println!("2. broker.verification.max_offer_age_secs to reject stale offers");
    println!("3. broker.retention.completed_ttl_secs to evict finished jobs");
    println!("4. broker.storage.blob_dir for binary results");
    println!();
    println!("Example usage:");
    println!("  cargo run --bin radio-server -- --config {}", path);

    Ok(())
}
