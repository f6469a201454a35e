//! Device and packet filter sync

use crate::device::{WireguardDevice, compute_peer_diff};
use crate::error::AgentError;
use crate::firewall::{Firewall, generate_table};
use crate::settings::AgentSettings;
use crds::State;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Applies a validated state to the host.
///
/// Syncs are serialized so the watcher and the health probe never interleave
/// device or filter updates.
pub struct Syncer {
    device: Arc<dyn WireguardDevice>,
    firewall: Arc<dyn Firewall>,
    settings: Arc<AgentSettings>,
    lock: Mutex<()>,
}

impl Syncer {
    #[must_use]
    pub fn new(
        device: Arc<dyn WireguardDevice>,
        firewall: Arc<dyn Firewall>,
        settings: Arc<AgentSettings>,
    ) -> Self {
        Self {
            device,
            firewall,
            settings,
            lock: Mutex::new(()),
        }
    }

    /// Sync the device, then the packet filter.
    ///
    /// The filter is applied even when the device sync fails.
    ///
    /// # Errors
    ///
    /// Returns the device error if there was one, otherwise the filter error.
    pub async fn sync(&self, state: &State) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;

        let device = self.sync_device(state).await;
        if let Err(e) = &device {
            error!("WireGuard sync failed: {}", e);
        }

        let table = generate_table(state, &self.settings);
        let firewall = self.firewall.apply(&table).await;
        if let Err(e) = &firewall {
            error!("Packet filter sync failed: {}", e);
        }

        device.and(firewall)
    }

    async fn sync_device(&self, state: &State) -> Result<(), AgentError> {
        self.device.ensure_link(&self.settings).await?;
        self.device.ensure_address(&self.settings).await?;

        let live = self.device.peers(&self.settings).await?;
        let changes = compute_peer_diff(&live, &state.peers);
        self.device
            .configure(&self.settings, &state.server_private_key, &changes)
            .await?;

        info!(
            "Synced {} with {} peers ({} changes)",
            self.settings.interface,
            state.peers.iter().filter(|peer| peer.is_active()).count(),
            changes.len()
        );
        Ok(())
    }
}
