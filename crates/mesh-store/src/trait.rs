//! ObjectStore trait for mocking
//!
//! This trait abstracts the Kubernetes API so reconcilers can be unit tested
//! against an in-memory implementation.

use crate::error::StoreError;
use crds::{Wireguard, WireguardPeer};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod, Secret, Service};
use std::collections::BTreeMap;

/// Typed CRUD over the objects the operator reads and writes
///
/// Create and update calls take the namespace and name from the object's
/// metadata. Updates are rejected with [`StoreError::Conflict`] when the
/// object's `resourceVersion` is stale. All async methods must be `Send` to
/// work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    // Wireguard
    async fn get_wireguard(&self, namespace: &str, name: &str) -> Result<Wireguard, StoreError>;
    async fn update_wireguard_status(&self, wireguard: &Wireguard) -> Result<Wireguard, StoreError>;

    // WireguardPeer
    async fn get_peer(&self, namespace: &str, name: &str) -> Result<WireguardPeer, StoreError>;
    async fn list_peers(&self, namespace: &str) -> Result<Vec<WireguardPeer>, StoreError>;
    async fn update_peer(&self, peer: &WireguardPeer) -> Result<WireguardPeer, StoreError>;
    async fn update_peer_status(&self, peer: &WireguardPeer) -> Result<WireguardPeer, StoreError>;

    // Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StoreError>;
    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError>;
    async fn update_secret(&self, secret: &Secret) -> Result<Secret, StoreError>;

    // Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, StoreError>;
    async fn create_service(&self, service: &Service) -> Result<Service, StoreError>;

    // Deployment
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError>;
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError>;
    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError>;

    // Pod
    async fn list_pods(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Pod>, StoreError>;
    async fn update_pod(&self, pod: &Pod) -> Result<Pod, StoreError>;

    // Node (cluster scoped)
    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;
}

/// Render a label map as a `key=value,...` selector
#[must_use]
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
