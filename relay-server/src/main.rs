//! Beat Sync Relay
//!
//! Authenticating WebSocket relay that fans coordination messages out to
//! the other members of a session, with a terminal dashboard.
//!
//! Usage:
//!   cargo run --release
//!   cargo run --release -- --no-dashboard  # Plain logging mode
//!
//! Configured through `RELAY_BIND`, `RELAY_PORT`, `RELAY_TOKENS` and
//! `RELAY_MAX_MESSAGE_BYTES`.

mod auth;
mod config;
mod dashboard;
mod hub;
mod metrics;
mod network;

use std::sync::Arc;
use parking_lot::RwLock;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let use_dashboard = !args.contains(&"--no-dashboard".to_string());

    let config = config::RelayConfig::from_env();

    // Shared metrics state
    let metrics = Arc::new(RwLock::new(metrics::Metrics::new()));

    if use_dashboard {
        dashboard::run(metrics, config).await
    } else {
        network::run_with_logging(metrics, config).await
    }
}
