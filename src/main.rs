//! linepulse: a minimal TCP exerciser
//!
//! Modes:
//! - `server`: accept any number of clients and log each line they send
//! - `client`: send a timestamped line every period, reconnecting on failure
//! - `loggen`: print random log lines on a timer
//!
//! Configuration comes from CLI arguments, an optional TOML file and
//! environment overrides (`SERVER_ADDR`, `SEND_PERIOD`, `LOGGEN_*`).

mod client;
mod config;
mod loggen;
mod message;
mod server;

use config::{ClientConfig, Config, LoggenConfig, Mode};
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(mode = ?config.mode, "Starting linepulse");

    match config.mode {
        Mode::Server => run_server().await,
        Mode::Client => run_client(&config).await,
        Mode::Loggen => {
            loggen::run(LoggenConfig::resolve(&config.file.loggen, config::process_env)).await;
            Ok(())
        }
    }
}

/// Bind failure is fatal; after that the accept loop never returns.
async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(config::SERVER_LISTEN_ADDR)
        .await
        .map_err(|e| format!("Failed to start server: {e}"))?;
    server.run().await;
    Ok(())
}

/// Returns only when a tick exhausts its send attempts.
async fn run_client(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let client_config = ClientConfig::resolve(&config.file.client, config::process_env);
    client::run(client_config).await?;
    Ok(())
}
