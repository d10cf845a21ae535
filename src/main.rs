//! ppchat - serverless LAN chat endpoint.
//!
//! Peers discover each other over multicast UDP and talk over direct TCP
//! links; everything runs on a single-threaded reactor of cooperating
//! modules.

mod config;
mod net;
mod reactor;
mod ui;

use crate::config::Config;
use crate::net::Network;
use crate::reactor::Reactor;
use crate::ui::TermUi;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    // Load configuration; a missing file just means defaults.
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ppchat.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path).map_err(|e| {
            error!(path = %config_path, error = %e, "Failed to load config");
            e
        })?
    } else {
        info!(path = %config_path, "No config file, using defaults");
        Config::default()
    };

    info!(
        name = %config.user.name,
        nick = %config.nick(),
        port = config.net.port,
        "Starting ppchat"
    );

    let network = Network::bind(config).await?;
    let term = TermUi::new(network.me().clone());

    let mut reactor = Reactor::new();
    reactor.register(Box::new(network));
    reactor.register(Box::new(term));
    reactor.run().await?;

    info!("Shutdown complete");
    Ok(())
}
