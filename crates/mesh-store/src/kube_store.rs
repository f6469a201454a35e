//! Kubernetes-backed [`ObjectStore`]

use crate::error::StoreError;
use crate::store_trait::{ObjectStore, label_selector};
use crds::{Wireguard, WireguardPeer};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod, Secret, Service};
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Object store talking to the Kubernetes API server
///
/// Every call is bounded by `timeout`; a call that outlives it is dropped and
/// reported as [`StoreError::Timeout`] so no write lands after the caller
/// gave up.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    timeout: Duration,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl KubeStore {
    /// Create a store from an existing client
    #[must_use]
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn call<T, F>(&self, what: String, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, kube::Error>> + Send,
    {
        debug!("store call: {}", what);
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| StoreError::from_kube(e, &what)),
            Err(_elapsed) => Err(StoreError::Timeout(what)),
        }
    }

    async fn get<K>(&self, kind: &str, namespace: &str, name: &str) -> Result<K, StoreError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug + Send + Sync,
        K::DynamicType: Default,
    {
        let api: Api<K> = self.namespaced(namespace);
        self.call(format!("get {kind} {namespace}/{name}"), api.get(name)).await
    }

    async fn create<K>(&self, kind: &str, obj: &K) -> Result<K, StoreError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync,
        K::DynamicType: Default,
    {
        let (namespace, name) = object_key(kind, obj)?;
        let api: Api<K> = self.namespaced(&namespace);
        self.call(
            format!("create {kind} {namespace}/{name}"),
            api.create(&PostParams::default(), obj),
        )
        .await
    }

    /// Full replace; the API server rejects it with 409 when the carried
    /// resourceVersion is stale
    async fn replace<K>(&self, kind: &str, obj: &K) -> Result<K, StoreError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync,
        K::DynamicType: Default,
    {
        let (namespace, name) = object_key(kind, obj)?;
        let api: Api<K> = self.namespaced(&namespace);
        self.call(
            format!("update {kind} {namespace}/{name}"),
            api.replace(&name, &PostParams::default(), obj),
        )
        .await
    }

    /// Merge patch of the status subresource, guarded by resourceVersion
    async fn patch_status<K, S>(&self, kind: &str, obj: &K, status: &S) -> Result<K, StoreError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug + Send + Sync,
        K::DynamicType: Default,
        S: Serialize + Sync,
    {
        let (namespace, name) = object_key(kind, obj)?;
        let api: Api<K> = self.namespaced(&namespace);
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": status,
        });
        self.call(
            format!("update {kind} status {namespace}/{name}"),
            api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
    }
}

fn object_key<K: Resource>(kind: &str, obj: &K) -> Result<(String, String), StoreError> {
    let name = obj.meta().name.clone()
        .ok_or_else(|| StoreError::InvalidObject(format!("{kind} without a name")))?;
    let namespace = obj.meta().namespace.clone()
        .ok_or_else(|| StoreError::InvalidObject(format!("{kind} {name} without a namespace")))?;
    Ok((namespace, name))
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get_wireguard(&self, namespace: &str, name: &str) -> Result<Wireguard, StoreError> {
        self.get("Wireguard", namespace, name).await
    }

    async fn update_wireguard_status(&self, wireguard: &Wireguard) -> Result<Wireguard, StoreError> {
        self.patch_status("Wireguard", wireguard, &wireguard.status).await
    }

    async fn get_peer(&self, namespace: &str, name: &str) -> Result<WireguardPeer, StoreError> {
        self.get("WireguardPeer", namespace, name).await
    }

    async fn list_peers(&self, namespace: &str) -> Result<Vec<WireguardPeer>, StoreError> {
        let api: Api<WireguardPeer> = self.namespaced(namespace);
        let list = self
            .call(format!("list WireguardPeer {namespace}"), api.list(&ListParams::default()))
            .await?;
        Ok(list.items)
    }

    async fn update_peer(&self, peer: &WireguardPeer) -> Result<WireguardPeer, StoreError> {
        self.replace("WireguardPeer", peer).await
    }

    async fn update_peer_status(&self, peer: &WireguardPeer) -> Result<WireguardPeer, StoreError> {
        self.patch_status("WireguardPeer", peer, &peer.status).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StoreError> {
        self.get("Secret", namespace, name).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        self.create("Secret", secret).await
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        self.replace("Secret", secret).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, StoreError> {
        self.get("Service", namespace, name).await
    }

    async fn create_service(&self, service: &Service) -> Result<Service, StoreError> {
        self.create("Service", service).await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError> {
        self.get("Deployment", namespace, name).await
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.create("Deployment", deployment).await
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.replace("Deployment", deployment).await
    }

    async fn list_pods(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Pod>, StoreError> {
        let api: Api<Pod> = self.namespaced(namespace);
        let selector = label_selector(labels);
        let list = self
            .call(
                format!("list Pod {namespace} ({selector})"),
                api.list(&ListParams::default().labels(&selector)),
            )
            .await?;
        Ok(list.items)
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        self.replace("Pod", pod).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = self
            .call("list Node".to_string(), api.list(&ListParams::default()))
            .await?;
        Ok(list.items)
    }
}
