//! Relay agent binary

use anyhow::Context;
use clap::Parser;
use relay_agent::firewall::IptablesRestore;
use relay_agent::health::{self, HealthState};
use relay_agent::settings::{Args, log_level};
use relay_agent::system::SystemDevice;
use relay_agent::watcher::watch_state;
use relay_agent::Syncer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level(args.verbosity)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Arc::new(args.into_settings());
    info!("Starting relay agent");
    info!("Configuration:");
    info!("  Interface: {}", settings.interface);
    info!("  Listen port: {}", settings.listen_port);
    info!("  State file: {}", settings.state_path.display());
    info!("  Userspace only: {}", settings.use_userspace);
    info!("  Userspace fallback: {}", settings.userspace_fallback);
    info!("  Health address: {}", settings.health_addr);

    let syncer = Arc::new(Syncer::new(
        Arc::new(SystemDevice::new()),
        Arc::new(IptablesRestore::new()),
        Arc::clone(&settings),
    ));

    let watcher = watch_state(settings.state_path.clone(), Arc::clone(&syncer))
        .context("Failed to watch the state file")?;
    let health_state = HealthState::new(settings.state_path.clone(), Arc::clone(&syncer));

    tokio::select! {
        result = health::serve(settings.health_addr, health_state) => {
            result.context("Health endpoint failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    watcher.close().await;
    info!("Relay agent stopped");
    Ok(())
}
