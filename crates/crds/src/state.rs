//! Agent state blob
//!
//! The single document the operator writes into the relay Secret and the
//! node-side agent applies. JSON keys are fixed: `Server`, `ServerPrivateKey`
//! and `Peers`.

use crate::wireguard::{Wireguard, WireguardStatus};
use crate::wireguard_peer::WireguardPeer;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a base64 encoded 32 byte WireGuard key
pub const ENCODED_KEY_LEN: usize = 44;

/// Desired relay configuration consumed by the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// Relay snapshot (name, namespace, spec, resolved endpoint status)
    #[serde(rename = "Server")]
    pub server: Wireguard,

    /// Relay private key, base64
    #[serde(rename = "ServerPrivateKey")]
    pub server_private_key: String,

    /// Peers referencing the relay (name, namespace, spec)
    #[serde(rename = "Peers", default)]
    pub peers: Vec<WireguardPeer>,
}

/// Structural problems that make a state blob unusable
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    /// Private key missing
    #[error("server private key is not defined")]
    MissingPrivateKey,

    /// Private key not a 44 character base64 key
    #[error("server private key should be of length {ENCODED_KEY_LEN}")]
    InvalidPrivateKeyLength,

    /// Relay address not resolved yet
    #[error("server address is not defined")]
    MissingServerAddress,

    /// DNS not resolved yet
    #[error("dns is not defined")]
    MissingDns,

    /// Peer without a tunnel address
    #[error("peer with index {0} does not have the address defined")]
    PeerMissingAddress(usize),

    /// Peer without a public key
    #[error("peer with index {0} does not have a public key defined")]
    PeerMissingPublicKey(usize),
}

impl State {
    /// Build a blob from live objects, dropping volatile metadata and peer status
    #[must_use]
    pub fn new(server: &Wireguard, server_private_key: &str, peers: &[WireguardPeer]) -> Self {
        let mut server_snapshot = Wireguard::new(
            server.metadata.name.as_deref().unwrap_or_default(),
            server.spec.clone(),
        );
        server_snapshot.metadata = snapshot_meta(&server.metadata);
        server_snapshot.status = server.status.as_ref().map(snapshot_status);

        let peers = peers
            .iter()
            .map(|peer| {
                let mut snapshot = WireguardPeer::new(
                    peer.metadata.name.as_deref().unwrap_or_default(),
                    peer.spec.clone(),
                );
                snapshot.metadata = snapshot_meta(&peer.metadata);
                snapshot
            })
            .collect();

        Self {
            server: server_snapshot,
            server_private_key: server_private_key.to_string(),
            peers,
        }
    }

    /// Relay address as resolved by the operator
    #[must_use]
    pub fn server_address(&self) -> &str {
        self.server.status.as_ref().map_or("", |s| s.address.as_str())
    }

    /// DNS server as resolved by the operator
    #[must_use]
    pub fn dns(&self) -> &str {
        self.server.status.as_ref().map_or("", |s| s.dns.as_str())
    }

    /// Check the blob is complete enough to apply.
    ///
    /// Checks run in a fixed order and the first failure wins.
    ///
    /// # Errors
    ///
    /// Returns the first [`StateError`] found.
    pub fn validate(&self) -> Result<(), StateError> {
        if self.server_private_key.is_empty() {
            return Err(StateError::MissingPrivateKey);
        }
        if self.server_private_key.len() != ENCODED_KEY_LEN {
            return Err(StateError::InvalidPrivateKeyLength);
        }
        if self.server_address().is_empty() {
            return Err(StateError::MissingServerAddress);
        }
        if self.dns().is_empty() {
            return Err(StateError::MissingDns);
        }
        for (index, peer) in self.peers.iter().enumerate() {
            if peer.address().is_none() {
                return Err(StateError::PeerMissingAddress(index));
            }
            if peer.public_key().is_none() {
                return Err(StateError::PeerMissingPublicKey(index));
            }
        }
        Ok(())
    }
}

// Phase, message and sub-resource states change on most passes and stay out of the blob
fn snapshot_status(status: &WireguardStatus) -> WireguardStatus {
    WireguardStatus {
        address: status.address.clone(),
        port: status.port.clone(),
        dns: status.dns.clone(),
        dns_search_domain: status.dns_search_domain.clone(),
        public_key: status.public_key.clone(),
        ..Default::default()
    }
}

fn snapshot_meta(meta: &ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        name: meta.name.clone(),
        namespace: meta.namespace.clone(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManagedResourceStatus, Phase, WireguardPeerSpec, WireguardSpec};

    const KEY: &str = "aGVsbG8gd29ybGQgaGVsbG8gd29ybGQgaGVsbG8gd28=";

    fn server() -> Wireguard {
        let mut wg = Wireguard::new("vpn", WireguardSpec::default());
        wg.metadata.namespace = Some("default".to_string());
        wg.metadata.resource_version = Some("42".to_string());
        wg.metadata.uid = Some("uid-1".to_string());
        wg.status = Some(WireguardStatus {
            address: "203.0.113.10".to_string(),
            dns: "1.1.1.1".to_string(),
            ..Default::default()
        });
        wg
    }

    fn peer(address: Option<&str>, key: Option<&str>) -> WireguardPeer {
        let mut p = WireguardPeer::new(
            "alice",
            WireguardPeerSpec {
                wireguard_ref: "vpn".to_string(),
                address: address.map(str::to_string),
                public_key: key.map(str::to_string),
                ..Default::default()
            },
        );
        p.metadata.namespace = Some("default".to_string());
        p
    }

    #[test]
    fn test_valid_state() {
        let state = State::new(&server(), KEY, &[peer(Some("10.8.0.2"), Some(KEY))]);
        assert_eq!(KEY.len(), ENCODED_KEY_LEN);
        assert_eq!(state.validate(), Ok(()));
    }

    #[test]
    fn test_validation_failures() {
        let cases = vec![
            (State::new(&server(), "", &[]), StateError::MissingPrivateKey),
            (State::new(&server(), "short", &[]), StateError::InvalidPrivateKeyLength),
            (
                State::new(&server(), KEY, &[peer(Some("10.8.0.2"), Some(KEY)), peer(None, Some(KEY))]),
                StateError::PeerMissingAddress(1),
            ),
            (
                State::new(&server(), KEY, &[peer(Some("10.8.0.2"), None)]),
                StateError::PeerMissingPublicKey(0),
            ),
        ];

        for (state, expected) in cases {
            assert_eq!(state.validate(), Err(expected));
        }
    }

    #[test]
    fn test_missing_address_then_dns() {
        let mut wg = server();
        wg.status = Some(WireguardStatus::default());
        let state = State::new(&wg, KEY, &[]);
        assert_eq!(state.validate(), Err(StateError::MissingServerAddress));

        let mut wg = server();
        if let Some(status) = wg.status.as_mut() {
            status.dns.clear();
        }
        // An incomplete peer does not mask the dns error
        let state = State::new(&wg, KEY, &[peer(None, None)]);
        assert_eq!(state.validate(), Err(StateError::MissingDns));
        assert_eq!(
            StateError::PeerMissingAddress(3).to_string(),
            "peer with index 3 does not have the address defined"
        );
    }

    #[test]
    fn test_snapshot_strips_volatile_metadata() {
        let state = State::new(&server(), KEY, &[peer(Some("10.8.0.2"), Some(KEY))]);
        assert_eq!(state.server.metadata.resource_version, None);
        assert_eq!(state.server.metadata.uid, None);
        assert_eq!(state.server.metadata.namespace.as_deref(), Some("default"));

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["ServerPrivateKey"], KEY);
        assert_eq!(json["Server"]["kind"], "Wireguard");
        assert_eq!(json["Peers"][0]["spec"]["address"], "10.8.0.2");
        assert!(json["Peers"][0].get("status").map_or(true, serde_json::Value::is_null));

        let back: State = serde_json::from_value(json).unwrap();
        assert_eq!(back.server_address(), "203.0.113.10");
    }

    #[test]
    fn test_blob_ignores_phase_and_message() {
        let before = serde_json::to_vec(&State::new(&server(), KEY, &[])).unwrap();

        let mut wg = server();
        if let Some(status) = wg.status.as_mut() {
            status.status = Some(Phase::Ready);
            status.message = "VPN is active!".to_string();
            status.unique_identifier = "abcd1234".to_string();
            status.resources.push(ManagedResourceStatus {
                name: "vpn-abcd1234".to_string(),
                kind: "Secret".to_string(),
                status: Phase::Ready,
            });
        }
        let state = State::new(&wg, KEY, &[]);
        assert_eq!(serde_json::to_vec(&state).unwrap(), before);
        assert_eq!(state.server_address(), "203.0.113.10");
        assert_eq!(state.dns(), "1.1.1.1");
    }
}
