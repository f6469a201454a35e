//! WireguardPeer CRD
//!
//! A VPN client joining a relay. The peer's key pair is generated by the
//! operator; the private key lives in a Secret referenced from the spec.

use crate::phase::Phase;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vpn.wgmesh.io",
    version = "v1alpha1",
    kind = "WireguardPeer",
    namespaced,
    status = "WireguardPeerStatus",
    shortname = "wgpeer",
    printcolumn = r#"{"name":"Relay","type":"string","jsonPath":".spec.wireguardRef"}"#,
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".spec.address"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WireguardPeerSpec {
    /// Name of the Wireguard relay in the same namespace (required, non-empty)
    pub wireguard_ref: String,

    /// Tunnel address; allocated from the relay pool when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Allowed IPs override for the client side
    #[serde(default, rename = "allowedIPs", skip_serializing_if = "Option::is_none")]
    pub allowed_ips: Option<String>,

    /// Disabled peers keep their address but are removed from the relay
    #[serde(default)]
    pub disabled: bool,

    /// DNS override for this peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,

    /// Where the peer private key is stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_ref: Option<PrivateKeyRef>,

    /// Peer public key, filled by the operator on first reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// Egress filtering rules applied on the relay
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress_network_policies: Vec<EgressNetworkPolicy>,

    /// Declared download limit (not enforced)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_speed: Option<Speed>,

    /// Declared upload limit (not enforced)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_speed: Option<Speed>,
}

/// Reference to the Secret key holding the peer private key
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrivateKeyRef {
    /// Secret name and key
    pub secret_key_ref: SecretKeySelector,
}

/// Secret name and data key
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct SecretKeySelector {
    /// Secret name
    pub name: String,

    /// Data key inside the Secret
    pub key: String,
}

/// One egress rule for a peer
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct EgressNetworkPolicy {
    /// Verdict; rules without one reject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<PolicyAction>,

    /// Destination filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<EgressTarget>,

    /// Protocol filter; a port without a protocol matches both TCP and UDP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
}

/// Destination of an egress rule
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct EgressTarget {
    /// Destination IP or CIDR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// Destination port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

/// Egress rule verdict
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum PolicyAction {
    /// Allow the traffic
    #[serde(alias = "ACCEPT")]
    Accept,

    /// Reject the traffic
    #[serde(alias = "REJECT")]
    Reject,
}

impl PolicyAction {
    /// iptables target name
    #[must_use]
    pub fn target(self) -> &'static str {
        match self {
            PolicyAction::Accept => "ACCEPT",
            PolicyAction::Reject => "REJECT",
        }
    }
}

/// Egress rule protocol
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum Protocol {
    /// TCP
    #[serde(rename = "TCP", alias = "tcp")]
    Tcp,

    /// UDP
    #[serde(rename = "UDP", alias = "udp")]
    Udp,

    /// ICMP
    #[serde(rename = "ICMP", alias = "icmp")]
    Icmp,
}

impl Protocol {
    /// Protocol name as passed to `iptables -p`
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
        }
    }
}

/// Declared bandwidth limit
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Speed {
    /// Amount, in `unit`
    #[serde(rename = "config")]
    pub value: i32,

    /// Unit of `value`
    pub unit: SpeedUnit,
}

/// Bandwidth unit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpeedUnit {
    /// Megabits per second
    Mbps,

    /// Kilobits per second
    Kbps,
}

/// Observed state of a peer
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct WireguardPeerStatus {
    /// Rendered client configuration
    #[serde(default)]
    pub config: String,

    /// Lifecycle phase
    #[serde(default)]
    pub status: Option<Phase>,

    /// Human readable progress or error message
    #[serde(default)]
    pub message: String,
}

impl WireguardPeer {
    /// Allocated or fixed tunnel address, if any
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.spec.address.as_deref().filter(|a| !a.is_empty())
    }

    /// Public key, if one was generated
    #[must_use]
    pub fn public_key(&self) -> Option<&str> {
        self.spec.public_key.as_deref().filter(|k| !k.is_empty())
    }

    /// Whether the peer belongs in the relay's live configuration
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.spec.disabled && self.public_key().is_some()
    }

    /// Current phase, `None` before the first reconcile
    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        self.status.as_ref().and_then(|s| s.status)
    }
}
