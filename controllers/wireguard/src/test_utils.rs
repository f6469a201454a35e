//! Test utilities for unit testing reconcilers
//!
//! Builders for test objects plus helpers that run a reconciler against a
//! [`MockStore`] until it reaches a fixed point.

use crate::config::OperatorConfig;
use crate::reconciler::{Outcome, Reconciler};
use crds::{Wireguard, WireguardPeer, WireguardPeerSpec, WireguardSpec};
use k8s_openapi::api::core::v1::{Node, NodeAddress, NodeStatus, Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use mesh_store::MockStore;
use std::sync::Arc;

/// Upper bound on passes before a test declares the reconciler stuck
const MAX_PASSES: usize = 50;

pub const NAMESPACE: &str = "default";

/// Reconciler backed by `store` with default settings
pub fn test_reconciler(store: &MockStore) -> Reconciler {
    Reconciler::new(Arc::new(store.clone()), Arc::new(OperatorConfig::default()))
}

pub fn test_wireguard(name: &str, spec: WireguardSpec) -> Wireguard {
    Wireguard {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

pub fn test_peer(name: &str, wireguard_ref: &str) -> WireguardPeer {
    WireguardPeer {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: WireguardPeerSpec {
            wireguard_ref: wireguard_ref.to_string(),
            ..Default::default()
        },
        status: None,
    }
}

/// `kube-dns` Service as found in most clusters
pub fn cluster_dns_service(cluster_ip: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("kube-dns".to_string()),
            namespace: Some("kube-system".to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some(cluster_ip.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn test_node(name: &str, addresses: &[(&str, &str)]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            addresses: Some(
                addresses
                    .iter()
                    .map(|(kind, address)| NodeAddress {
                        type_: kind.to_string(),
                        address: address.to_string(),
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Name shared by the sub-resources of relay `name`
pub fn relay_resource_name(store: &MockStore, name: &str) -> String {
    let wireguard = store.wireguard(NAMESPACE, name).expect("wireguard exists");
    let id = wireguard.status.expect("status set").unique_identifier;
    format!("{}-{}", name, id)
}

/// Reconcile relay `name` until a pass neither requeues nor writes
pub async fn settle_wireguard(reconciler: &Reconciler, store: &MockStore, name: &str) -> Outcome {
    for _ in 0..MAX_PASSES {
        let before = store.write_count();
        let outcome = reconciler
            .reconcile_wireguard(NAMESPACE, name)
            .await
            .expect("reconcile_wireguard failed");
        if outcome != Outcome::Requeue && store.write_count() == before {
            return outcome;
        }
    }
    panic!("Wireguard {} did not settle after {} passes", name, MAX_PASSES);
}

/// Reconcile peer `name` until a pass neither requeues nor writes
pub async fn settle_peer(reconciler: &Reconciler, store: &MockStore, name: &str) -> Outcome {
    for _ in 0..MAX_PASSES {
        let before = store.write_count();
        let outcome = reconciler
            .reconcile_peer(NAMESPACE, name)
            .await
            .expect("reconcile_peer failed");
        if outcome != Outcome::Requeue && store.write_count() == before {
            return outcome;
        }
    }
    panic!("WireguardPeer {} did not settle after {} passes", name, MAX_PASSES);
}

/// Drive a LoadBalancer relay all the way to Ready, playing the platform's
/// part (ingress assignment, pod readiness) along the way
pub async fn ready_wireguard(reconciler: &Reconciler, store: &MockStore, name: &str) -> Wireguard {
    settle_wireguard(reconciler, store, name).await;
    let resource_name = relay_resource_name(store, name);
    store.set_load_balancer_ingress(NAMESPACE, &resource_name, Some("203.0.113.7"), None);
    settle_wireguard(reconciler, store, name).await;
    store.set_deployment_ready(NAMESPACE, &resource_name, 1);
    settle_wireguard(reconciler, store, name).await;
    store.wireguard(NAMESPACE, name).expect("wireguard exists")
}
