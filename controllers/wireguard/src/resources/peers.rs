//! Peer roster: address allocation and rendered client configs.

use super::{RelayIdentity, ResourceContext};
use crate::allocator::{allocate, used_addresses, AllocationError};
use crate::error::ControllerError;
use crds::{Phase, Wireguard, WireguardPeer, WireguardPeerStatus, WireguardStatus};
use ipnetwork::Ipv4Network;
use tracing::{debug, info, warn};

/// Status message of a peer whose config was rendered
pub const PEER_CONFIGURED: &str = "Peer configured";

pub struct PeerRosterResource {
    wireguard: Wireguard,
    relay: RelayIdentity,
    ctx: ResourceContext,
}

/// Render the client configuration of `peer` against relay `server`.
///
/// Returns `None` while the relay has not resolved its public key, endpoint
/// and DNS yet, or while the peer has no address.
pub fn render_peer_config(server: &Wireguard, peer: &WireguardPeer) -> Option<String> {
    let status: &WireguardStatus = server.status.as_ref()?;
    let address = peer.address()?;
    if status.public_key.is_empty() || status.address.is_empty() || status.port.is_empty() {
        return None;
    }

    let mut dns = match peer.spec.dns.as_deref().filter(|d| !d.is_empty()) {
        Some(dns) => dns.to_string(),
        None if !status.dns.is_empty() => status.dns.clone(),
        None => return None,
    };
    if !status.dns_search_domain.is_empty() {
        dns = format!("{}, {}", dns, status.dns_search_domain);
    }

    let name = peer.metadata.name.as_deref().unwrap_or_default();
    let namespace = peer.metadata.namespace.as_deref().unwrap_or_default();

    let mut config = format!(
        "\necho \"\n[Interface]\nPrivateKey = $(kubectl get secret {}-peer --template={{{{.data.privateKey}}}} -n {} | base64 -d)\nAddress = {}\nDNS = {}",
        name, namespace, address, dns
    );
    if let Some(mtu) = server.spec.mtu.as_deref().filter(|m| !m.is_empty()) {
        config.push_str("\nMTU = ");
        config.push_str(mtu);
    }
    config.push_str(&format!(
        "\n\n[Peer]\nPublicKey = {}\nAllowedIPs = 0.0.0.0/0\nEndpoint = {}:{}\"",
        status.public_key, status.address, status.port
    ));
    Some(config)
}

fn is_configured(peer: &WireguardPeer, config: &str) -> bool {
    peer.status.as_ref().is_some_and(|s| {
        s.config == config && s.status == Some(Phase::Ready) && s.message == PEER_CONFIGURED
    })
}

/// Whether `peer` is parked without an address because `pool` ran out
pub(crate) fn is_pool_exhausted(peer: &WireguardPeer, pool: Ipv4Network) -> bool {
    peer.address().is_none()
        && peer.status.as_ref().is_some_and(|s| {
            s.status == Some(Phase::Error) && s.message == AllocationError::Exhausted(pool).to_string()
        })
}

impl PeerRosterResource {
    pub const KIND: &'static str = "Peers";

    pub(crate) fn new(wireguard: &Wireguard, relay: RelayIdentity, ctx: ResourceContext) -> Self {
        Self {
            wireguard: wireguard.clone(),
            relay,
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.relay.resource_name
    }

    async fn peers(&self) -> Result<Vec<WireguardPeer>, ControllerError> {
        let mut peers: Vec<WireguardPeer> = self.ctx.store
            .list_peers(&self.relay.namespace)
            .await?
            .into_iter()
            .filter(|p| p.spec.wireguard_ref == self.relay.name)
            .collect();
        peers.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(peers)
    }

    pub async fn create(&self) -> Result<(), ControllerError> {
        self.update().await
    }

    pub async fn needs_update(&self) -> Result<bool, ControllerError> {
        let config = &self.ctx.config;
        let peers = self.peers().await?;
        let pool_full = allocate(config.pool, &used_addresses(config.pool, config.gateway, &peers)).is_err();

        for peer in peers {
            if peer.address().is_none() {
                if pool_full && is_pool_exhausted(&peer, config.pool) {
                    continue;
                }
                return Ok(true);
            }
            if let Some(rendered) = render_peer_config(&self.wireguard, &peer) {
                if !is_configured(&peer, &rendered) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Allocate addresses for unaddressed peers, then write every rendered
    /// config that differs from the stored one.
    ///
    /// A peer the pool has no room for gets an Error status and the rest of
    /// the roster is still processed.
    pub async fn update(&self) -> Result<(), ControllerError> {
        let config = &self.ctx.config;
        let peers = self.peers().await?;
        let mut used = used_addresses(config.pool, config.gateway, &peers);

        for mut peer in peers {
            if peer.address().is_none() {
                let ip = match allocate(config.pool, &used) {
                    Ok(ip) => ip,
                    Err(e) => {
                        self.park(&mut peer, &e).await?;
                        continue;
                    }
                };
                used.insert(ip);
                peer.spec.address = Some(ip.to_string());
                info!(
                    "Allocated {} to peer {}/{}",
                    ip,
                    self.relay.namespace,
                    peer.metadata.name.as_deref().unwrap_or_default()
                );
                peer = self.ctx.store.update_peer(&peer).await?;
            }

            let Some(rendered) = render_peer_config(&self.wireguard, &peer) else {
                debug!(
                    "Relay {}/{} not resolved yet, deferring config of peer {:?}",
                    self.relay.namespace, self.relay.name, peer.metadata.name
                );
                continue;
            };
            if is_configured(&peer, &rendered) {
                continue;
            }
            peer.status = Some(WireguardPeerStatus {
                config: rendered,
                status: Some(Phase::Ready),
                message: PEER_CONFIGURED.to_string(),
            });
            self.ctx.store.update_peer_status(&peer).await?;
        }
        Ok(())
    }

    pub async fn converged(&self) -> Result<bool, ControllerError> {
        Ok(true)
    }

    async fn park(&self, peer: &mut WireguardPeer, error: &AllocationError) -> Result<(), ControllerError> {
        warn!(
            "Cannot address peer {}/{}: {}",
            self.relay.namespace,
            peer.metadata.name.as_deref().unwrap_or_default(),
            error
        );
        if is_pool_exhausted(peer, self.ctx.config.pool) {
            return Ok(());
        }
        peer.status = Some(WireguardPeerStatus {
            config: String::new(),
            status: Some(Phase::Error),
            message: error.to_string(),
        });
        self.ctx.store.update_peer_status(peer).await?;
        Ok(())
    }
}
