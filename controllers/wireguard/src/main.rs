//! Wireguard Controller
//!
//! Operator for a WireGuard VPN mesh:
//! - Wireguard: provisions a relay (keys, Service, Deployment) and publishes
//!   its endpoint once reachable
//! - WireguardPeer: provisions peer keys and links peers to their relay
//!
//! Peer addresses are allocated and client configs rendered by the relay's
//! reconcile loop.

mod allocator;
mod backoff;
mod config;
mod controller;
mod error;
mod keys;
mod reconciler;
mod resources;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::OperatorConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Wireguard Controller");

    let config = OperatorConfig::from_env()?;

    info!("Configuration:");
    info!("  Agent image: {} ({})", config.agent_image, config.image_pull_policy);
    info!("  Metrics image: {}", config.metrics_image);
    info!("  Peer pool: {} (gateway {})", config.pool, config.gateway);
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Store timeout: {:?}", config.store_timeout);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
