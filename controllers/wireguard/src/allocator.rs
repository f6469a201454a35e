//! Peer address allocation.
//!
//! Deterministic first-free allocation over an IPv4 pool. Addresses are never
//! recycled: every address a peer ever received stays in the used set, even
//! for disabled peers.

use crds::WireguardPeer;
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::warn;

/// Allocation failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// Every host address of the pool is taken
    #[error("no available ip found in {0}")]
    Exhausted(Ipv4Network),
}

/// Return the lowest host address of `pool` not present in `used`.
///
/// The network and broadcast addresses are never handed out.
pub fn allocate(pool: Ipv4Network, used: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr, AllocationError> {
    let network = pool.network();
    let broadcast = pool.broadcast();

    pool.iter()
        .filter(|ip| *ip != network && *ip != broadcast)
        .find(|ip| !used.contains(ip))
        .ok_or(AllocationError::Exhausted(pool))
}

/// Addresses that must not be allocated: the pool network address, the relay
/// gateway and every address already assigned to a peer.
pub fn used_addresses(pool: Ipv4Network, gateway: Ipv4Addr, peers: &[WireguardPeer]) -> HashSet<Ipv4Addr> {
    let mut used = HashSet::from([pool.network(), gateway]);
    for peer in peers {
        let Some(address) = peer.address() else {
            continue;
        };
        let host = address.split('/').next().unwrap_or(address);
        match host.parse::<Ipv4Addr>() {
            Ok(ip) => {
                used.insert(ip);
            }
            Err(_) => warn!(
                "Ignoring unparsable address '{}' of peer {}",
                address,
                peer.metadata.name.as_deref().unwrap_or("<unknown>")
            ),
        }
    }
    used
}
