//! Wireguard CRD
//!
//! Declares one relay (VPN server) instance. The operator derives a Secret,
//! a Service, a Deployment and the peer roster from it.

use crate::phase::Phase;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vpn.wgmesh.io",
    version = "v1alpha1",
    kind = "Wireguard",
    namespaced,
    status = "WireguardStatus",
    shortname = "wg",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".status.address"}"#,
    printcolumn = r#"{"name":"Port","type":"string","jsonPath":".status.port"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WireguardSpec {
    /// MTU written into every rendered peer configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<String>,

    /// Fixed public address of the relay; overrides whatever the Service reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// DNS server handed to peers; defaults to the cluster DNS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,

    /// How the relay UDP port is exposed
    #[serde(default)]
    pub service_type: ServiceType,

    /// Run a privileged init container that enables net.ipv4.ip_forward
    #[serde(default)]
    pub enable_ip_forward_on_pod_init: bool,

    /// Annotations copied onto the relay Service
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_annotations: BTreeMap<String, String>,

    /// Fixed node port when `serviceType` is NodePort
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,

    /// Skip the kernel module and run the userspace implementation directly
    #[serde(default)]
    pub use_wg_userspace_implementation: bool,
}

/// Service exposure type for the relay
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ServiceType {
    /// External load balancer (default)
    #[default]
    LoadBalancer,

    /// Port opened on every node
    NodePort,

    /// Cluster-internal only
    #[serde(rename = "ClusterIP")]
    ClusterIp,
}

impl ServiceType {
    /// Kubernetes Service `spec.type` value
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::LoadBalancer => "LoadBalancer",
            ServiceType::NodePort => "NodePort",
            ServiceType::ClusterIp => "ClusterIP",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of a relay.
///
/// Fields are always serialized (no `skip_serializing_if`) so that a merge
/// patch of the whole status clears values that went back to empty.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireguardStatus {
    /// Lifecycle phase; absent until the first reconcile
    #[serde(default)]
    pub status: Option<Phase>,

    /// Human readable progress or error message
    #[serde(default)]
    pub message: String,

    /// Suffix embedded in every managed sub-resource name, assigned once
    #[serde(default)]
    pub unique_identifier: String,

    /// Address peers connect to
    #[serde(default)]
    pub address: String,

    /// Port peers connect to
    #[serde(default)]
    pub port: String,

    /// DNS server handed to peers
    #[serde(default)]
    pub dns: String,

    /// DNS search domain handed to peers
    #[serde(default)]
    pub dns_search_domain: String,

    /// Relay public key
    #[serde(default)]
    pub public_key: String,

    /// Reconciliation checkpoints for managed sub-resources
    #[serde(default)]
    pub resources: Vec<ManagedResourceStatus>,
}

impl WireguardStatus {
    /// Look up the checkpoint of a managed sub-resource
    #[must_use]
    pub fn resource(&self, name: &str, kind: &str) -> Option<&ManagedResourceStatus> {
        self.resources
            .iter()
            .find(|r| r.name == name && r.kind == kind)
    }

    /// Mutable lookup of a managed sub-resource checkpoint
    pub fn resource_mut(&mut self, name: &str, kind: &str) -> Option<&mut ManagedResourceStatus> {
        self.resources
            .iter_mut()
            .find(|r| r.name == name && r.kind == kind)
    }
}

/// Checkpoint for one managed sub-resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct ManagedResourceStatus {
    /// Sub-resource object name
    pub name: String,

    /// Sub-resource discriminator ("Secret", "Service", "Deployment", "Peers")
    #[serde(rename = "type")]
    pub kind: String,

    /// Pending until the sub-resource converged once
    #[serde(default)]
    pub status: Phase,
}

impl Wireguard {
    /// Current phase, `None` while the object has never been reconciled
    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        self.status.as_ref().and_then(|s| s.status)
    }

    /// True once the relay is fully converged
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase() == Some(Phase::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults_to_load_balancer() {
        let spec: WireguardSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.service_type, ServiceType::LoadBalancer);
        assert!(!spec.use_wg_userspace_implementation);
        assert!(spec.service_annotations.is_empty());
    }

    #[test]
    fn test_cluster_ip_wire_name() {
        let spec: WireguardSpec =
            serde_json::from_str(r#"{"serviceType":"ClusterIP","nodePort":31820}"#).unwrap();
        assert_eq!(spec.service_type, ServiceType::ClusterIp);
        assert_eq!(spec.node_port, Some(31820));
        assert_eq!(spec.service_type.as_str(), "ClusterIP");
    }

    #[test]
    fn test_status_resource_lookup_matches_name_and_type() {
        let status = WireguardStatus {
            resources: vec![
                ManagedResourceStatus {
                    name: "vpn-abc".to_string(),
                    kind: "Secret".to_string(),
                    status: Phase::Ready,
                },
                ManagedResourceStatus {
                    name: "vpn-abc".to_string(),
                    kind: "Service".to_string(),
                    status: Phase::Pending,
                },
            ],
            ..Default::default()
        };

        assert_eq!(status.resource("vpn-abc", "Service").map(|r| r.status), Some(Phase::Pending));
        assert!(status.resource("vpn-abc", "Deployment").is_none());
    }

    #[test]
    fn test_status_serializes_empty_fields() {
        let json = serde_json::to_value(WireguardStatus::default()).unwrap();
        assert_eq!(json["address"], "");
        assert!(json["status"].is_null());
    }
}
