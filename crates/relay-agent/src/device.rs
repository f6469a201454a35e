//! WireGuard device seam and peer diffing

use crate::error::AgentError;
use crate::settings::AgentSettings;
use async_trait::async_trait;
use crds::WireguardPeer;
use std::collections::HashSet;

/// Peer as currently configured on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePeer {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
}

/// One peer level device change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerChange {
    /// Drop a peer the state no longer carries
    Remove(String),
    /// Replace the allowed address of a known peer
    Update { public_key: String, allowed_ip: String },
    /// Configure a new peer
    Add { public_key: String, allowed_ip: String },
}

/// Host operations the sync needs from the WireGuard link
#[async_trait]
pub trait WireguardDevice: Send + Sync {
    /// Create the link when absent, kernel first with a userspace fallback,
    /// then set the MTU and bring it up
    async fn ensure_link(&self, settings: &AgentSettings) -> Result<(), AgentError>;

    /// Add the gateway address and the pool route when absent
    async fn ensure_address(&self, settings: &AgentSettings) -> Result<(), AgentError>;

    /// Peers currently configured on the device
    async fn peers(&self, settings: &AgentSettings) -> Result<Vec<LivePeer>, AgentError>;

    /// Set the private key and listen port and apply peer changes
    async fn configure(
        &self,
        settings: &AgentSettings,
        private_key: &str,
        changes: &[PeerChange],
    ) -> Result<(), AgentError>;
}

/// Allowed address of a peer as a host route
#[must_use]
pub fn allowed_ip(address: &str) -> String {
    if address.contains('/') {
        address.to_string()
    } else {
        format!("{address}/32")
    }
}

/// Compute the changes that take the device from `live` to `desired`.
///
/// Only active peers with an address are desired. Removals come first in
/// device order, then updates and additions in state order.
#[must_use]
pub fn compute_peer_diff(live: &[LivePeer], desired: &[WireguardPeer]) -> Vec<PeerChange> {
    let wanted: Vec<(&str, String)> = desired
        .iter()
        .filter(|peer| peer.is_active())
        .filter_map(|peer| Some((peer.public_key()?, allowed_ip(peer.address()?))))
        .collect();
    let wanted_keys: HashSet<&str> = wanted.iter().map(|(key, _)| *key).collect();

    let mut changes: Vec<PeerChange> = live
        .iter()
        .filter(|peer| !wanted_keys.contains(peer.public_key.as_str()))
        .map(|peer| PeerChange::Remove(peer.public_key.clone()))
        .collect();

    for (key, ip) in wanted {
        match live.iter().find(|peer| peer.public_key == key) {
            Some(peer) if peer.allowed_ips == [ip.as_str()] => {}
            Some(_) => changes.push(PeerChange::Update {
                public_key: key.to_string(),
                allowed_ip: ip,
            }),
            None => changes.push(PeerChange::Add {
                public_key: key.to_string(),
                allowed_ip: ip,
            }),
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::test_peer;

    fn live(key: &str, ip: &str) -> LivePeer {
        LivePeer {
            public_key: key.to_string(),
            allowed_ips: vec![ip.to_string()],
        }
    }

    #[test]
    fn test_diff_remove_update_add() {
        let live_peers = vec![live("X", "10.8.0.2/32"), live("Y", "10.8.0.3/32")];
        let desired = vec![test_peer("y", "Y", "10.8.0.4"), test_peer("z", "Z", "10.8.0.5")];

        assert_eq!(
            compute_peer_diff(&live_peers, &desired),
            vec![
                PeerChange::Remove("X".to_string()),
                PeerChange::Update {
                    public_key: "Y".to_string(),
                    allowed_ip: "10.8.0.4/32".to_string(),
                },
                PeerChange::Add {
                    public_key: "Z".to_string(),
                    allowed_ip: "10.8.0.5/32".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_diff_in_sync_is_empty() {
        let live_peers = vec![live("Y", "10.8.0.3/32")];
        let desired = vec![test_peer("y", "Y", "10.8.0.3")];
        assert!(compute_peer_diff(&live_peers, &desired).is_empty());
    }

    #[test]
    fn test_disabled_peer_is_removed() {
        let live_peers = vec![live("Y", "10.8.0.3/32")];
        let mut peer = test_peer("y", "Y", "10.8.0.3");
        peer.spec.disabled = true;

        assert_eq!(
            compute_peer_diff(&live_peers, &[peer]),
            vec![PeerChange::Remove("Y".to_string())]
        );
    }

    #[test]
    fn test_allowed_ip() {
        assert_eq!(allowed_ip("10.8.0.2"), "10.8.0.2/32");
        assert_eq!(allowed_ip("10.8.0.0/30"), "10.8.0.0/30");
    }
}
