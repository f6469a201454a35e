//! Mock ObjectStore for unit testing
//!
//! Keeps objects in memory and mimics the API server semantics the
//! reconcilers rely on:
//! - every write bumps a `resourceVersion`
//! - updates with a stale `resourceVersion` fail with [`StoreError::Conflict`]
//! - spec updates keep the stored status and status updates keep the stored spec
//! - creating an existing object fails with [`StoreError::Conflict`]
//!
//! Every successful write is logged so tests can assert that a reconcile pass
//! was a no-op. [`MockStore::before_next_update`] lets a test slip a
//! competing write in between a reconciler's read and its update.

use crate::error::StoreError;
use crate::store_trait::ObjectStore;
use crds::{Wireguard, WireguardPeer};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Node, Pod, Secret, Service, ServiceStatus,
};
use kube::Resource;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Key = (String, String);
type Objects<K> = Arc<Mutex<HashMap<Key, K>>>;
type UpdateHook = Box<dyn FnOnce(&MockStore) + Send>;

/// In-memory object store for testing
#[derive(Clone, Default)]
pub struct MockStore {
    pub(crate) wireguards: Objects<Wireguard>,
    pub(crate) peers: Objects<WireguardPeer>,
    pub(crate) secrets: Objects<Secret>,
    pub(crate) services: Objects<Service>,
    pub(crate) deployments: Objects<Deployment>,
    pub(crate) pods: Objects<Pod>,
    pub(crate) nodes: Arc<Mutex<Vec<Node>>>,
    // Counter for generating resource versions and uids
    pub(crate) next_version: Arc<Mutex<u64>>,
    pub(crate) writes: Arc<Mutex<Vec<String>>>,
    // One-shot callbacks keyed by kind, run before the next update of that kind
    pub(crate) update_hooks: Arc<Mutex<Vec<(String, UpdateHook)>>>,
}

impl std::fmt::Debug for MockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockStore")
            .field("writes", &lock(&self.writes).len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key_of<K: Resource>(kind: &str, obj: &K) -> Result<Key, StoreError> {
    let meta = obj.meta();
    match (&meta.namespace, &meta.name) {
        (Some(ns), Some(name)) => Ok((ns.clone(), name.clone())),
        _ => Err(StoreError::InvalidObject(format!("{kind} without namespace or name"))),
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

impl MockStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> u64 {
        let mut v = lock(&self.next_version);
        *v += 1;
        *v
    }

    fn stamp<K: Resource>(&self, obj: &mut K) {
        let version = self.next_version();
        let meta = obj.meta_mut();
        meta.resource_version = Some(version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{version}"));
        }
    }

    fn record(&self, op: &str, kind: &str, key: &Key) {
        lock(&self.writes).push(format!("{op} {kind} {}/{}", key.0, key.1));
    }

    fn get_obj<K: Clone>(objects: &Objects<K>, kind: &str, namespace: &str, name: &str) -> Result<K, StoreError> {
        lock(objects)
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{kind} {namespace}/{name}")))
    }

    fn create_obj<K: Resource + Clone>(&self, objects: &Objects<K>, kind: &str, obj: &K) -> Result<K, StoreError> {
        let k = key_of(kind, obj)?;
        let mut map = lock(objects);
        if map.contains_key(&k) {
            return Err(StoreError::Conflict(format!("{kind} {}/{} already exists", k.0, k.1)));
        }
        let mut stored = obj.clone();
        self.stamp(&mut stored);
        map.insert(k.clone(), stored.clone());
        drop(map);
        self.record("create", kind, &k);
        Ok(stored)
    }

    /// Replace a stored object. `carry` copies whatever must survive from the
    /// stored object (status on spec writes, spec on status writes).
    fn update_obj<K, F>(&self, objects: &Objects<K>, kind: &str, obj: &K, carry: F) -> Result<K, StoreError>
    where
        K: Resource + Clone,
        F: FnOnce(&K, &mut K),
    {
        let k = key_of(kind, obj)?;
        self.run_update_hook(kind);
        let mut map = lock(objects);
        let current = map
            .get(&k)
            .ok_or_else(|| StoreError::NotFound(format!("{kind} {}/{}", k.0, k.1)))?;
        if let Some(version) = &obj.meta().resource_version {
            if current.meta().resource_version.as_ref() != Some(version) {
                return Err(StoreError::Conflict(format!(
                    "{kind} {}/{} has been modified",
                    k.0, k.1
                )));
            }
        }
        let mut stored = obj.clone();
        carry(current, &mut stored);
        stored.meta_mut().uid.clone_from(&current.meta().uid);
        self.stamp(&mut stored);
        map.insert(k.clone(), stored.clone());
        drop(map);
        self.record("update", kind, &k);
        Ok(stored)
    }

    fn run_update_hook(&self, kind: &str) {
        let hook = {
            let mut hooks = lock(&self.update_hooks);
            hooks
                .iter()
                .position(|(k, _)| k == kind)
                .map(|i| hooks.remove(i).1)
        };
        if let Some(hook) = hook {
            hook(self);
        }
    }

    fn put<K: Resource + Clone>(&self, objects: &Objects<K>, kind: &str, mut obj: K) -> K {
        self.stamp(&mut obj);
        if let Ok(k) = key_of(kind, &obj) {
            lock(objects).insert(k, obj.clone());
        }
        obj
    }

    // Test setup helpers: these do not count as writes

    /// Add or overwrite a Wireguard (for test setup)
    pub fn add_wireguard(&self, wireguard: Wireguard) -> Wireguard {
        self.put(&self.wireguards, "Wireguard", wireguard)
    }

    /// Add or overwrite a WireguardPeer (for test setup)
    pub fn add_peer(&self, peer: WireguardPeer) -> WireguardPeer {
        self.put(&self.peers, "WireguardPeer", peer)
    }

    /// Add or overwrite a Secret (for test setup)
    pub fn add_secret(&self, secret: Secret) -> Secret {
        self.put(&self.secrets, "Secret", secret)
    }

    /// Add or overwrite a Service (for test setup)
    pub fn add_service(&self, service: Service) -> Service {
        self.put(&self.services, "Service", service)
    }

    /// Add or overwrite a Pod (for test setup)
    pub fn add_pod(&self, pod: Pod) -> Pod {
        self.put(&self.pods, "Pod", pod)
    }

    /// Add a Node (for test setup)
    pub fn add_node(&self, node: Node) {
        lock(&self.nodes).push(node);
    }

    // Platform simulation: what controllers outside the operator would do

    /// Mark a Deployment as having `ready` ready replicas
    pub fn set_deployment_ready(&self, namespace: &str, name: &str, ready: i32) {
        if let Some(d) = lock(&self.deployments).get_mut(&key(namespace, name)) {
            d.status = Some(DeploymentStatus {
                replicas: Some(ready),
                ready_replicas: Some(ready),
                ..Default::default()
            });
        }
    }

    /// Assign a load balancer ingress to a Service
    pub fn set_load_balancer_ingress(&self, namespace: &str, name: &str, ip: Option<&str>, hostname: Option<&str>) {
        if let Some(s) = lock(&self.services).get_mut(&key(namespace, name)) {
            s.status = Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: ip.map(str::to_string),
                        hostname: hostname.map(str::to_string),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            });
        }
    }

    /// Assign a node port to the first port of a Service
    pub fn set_node_port(&self, namespace: &str, name: &str, node_port: i32) {
        if let Some(s) = lock(&self.services).get_mut(&key(namespace, name)) {
            if let Some(port) = s
                .spec
                .as_mut()
                .and_then(|spec| spec.ports.as_mut())
                .and_then(|ports| ports.first_mut())
            {
                port.node_port = Some(node_port);
            }
        }
    }

    // Inspection helpers

    /// Stored Wireguard, if any
    #[must_use]
    pub fn wireguard(&self, namespace: &str, name: &str) -> Option<Wireguard> {
        lock(&self.wireguards).get(&key(namespace, name)).cloned()
    }

    /// Stored WireguardPeer, if any
    #[must_use]
    pub fn peer(&self, namespace: &str, name: &str) -> Option<WireguardPeer> {
        lock(&self.peers).get(&key(namespace, name)).cloned()
    }

    /// Stored Secret, if any
    #[must_use]
    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        lock(&self.secrets).get(&key(namespace, name)).cloned()
    }

    /// Stored Service, if any
    #[must_use]
    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        lock(&self.services).get(&key(namespace, name)).cloned()
    }

    /// Stored Deployment, if any
    #[must_use]
    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        lock(&self.deployments).get(&key(namespace, name)).cloned()
    }

    /// Stored Pod, if any
    #[must_use]
    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        lock(&self.pods).get(&key(namespace, name)).cloned()
    }

    /// Run `hook` right before the next update of `kind` (e.g.
    /// `"WireguardPeer"`), after the caller has read the object
    pub fn before_next_update<F>(&self, kind: &str, hook: F)
    where
        F: FnOnce(&MockStore) + Send + 'static,
    {
        lock(&self.update_hooks).push((kind.to_string(), Box::new(hook)));
    }

    /// Number of successful writes so far
    #[must_use]
    pub fn write_count(&self) -> usize {
        lock(&self.writes).len()
    }

    /// Log of successful writes, e.g. `create Secret default/vpn-1a2b3c4d`
    #[must_use]
    pub fn writes(&self) -> Vec<String> {
        lock(&self.writes).clone()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MockStore {
    async fn get_wireguard(&self, namespace: &str, name: &str) -> Result<Wireguard, StoreError> {
        Self::get_obj(&self.wireguards, "Wireguard", namespace, name)
    }

    async fn update_wireguard_status(&self, wireguard: &Wireguard) -> Result<Wireguard, StoreError> {
        self.update_obj(&self.wireguards, "Wireguard/status", wireguard, |current, new| {
            new.spec = current.spec.clone();
            new.metadata = current.metadata.clone();
        })
    }

    async fn get_peer(&self, namespace: &str, name: &str) -> Result<WireguardPeer, StoreError> {
        Self::get_obj(&self.peers, "WireguardPeer", namespace, name)
    }

    async fn list_peers(&self, namespace: &str) -> Result<Vec<WireguardPeer>, StoreError> {
        let mut peers: Vec<WireguardPeer> = lock(&self.peers)
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, p)| p.clone())
            .collect();
        peers.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(peers)
    }

    async fn update_peer(&self, peer: &WireguardPeer) -> Result<WireguardPeer, StoreError> {
        self.update_obj(&self.peers, "WireguardPeer", peer, |current, new| {
            new.status = current.status.clone();
        })
    }

    async fn update_peer_status(&self, peer: &WireguardPeer) -> Result<WireguardPeer, StoreError> {
        self.update_obj(&self.peers, "WireguardPeer/status", peer, |current, new| {
            new.spec = current.spec.clone();
            new.metadata = current.metadata.clone();
        })
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StoreError> {
        Self::get_obj(&self.secrets, "Secret", namespace, name)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        self.create_obj(&self.secrets, "Secret", secret)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret, StoreError> {
        self.update_obj(&self.secrets, "Secret", secret, |_, _| {})
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, StoreError> {
        Self::get_obj(&self.services, "Service", namespace, name)
    }

    async fn create_service(&self, service: &Service) -> Result<Service, StoreError> {
        self.create_obj(&self.services, "Service", service)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError> {
        Self::get_obj(&self.deployments, "Deployment", namespace, name)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.create_obj(&self.deployments, "Deployment", deployment)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.update_obj(&self.deployments, "Deployment", deployment, |current, new| {
            new.status = current.status.clone();
        })
    }

    async fn list_pods(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Pod>, StoreError> {
        let pods = lock(&self.pods)
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, pod)| {
                let pod_labels = pod.metadata.labels.clone().unwrap_or_default();
                labels.iter().all(|(k, v)| pod_labels.get(k) == Some(v))
            })
            .map(|(_, pod)| pod.clone())
            .collect();
        Ok(pods)
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        self.update_obj(&self.pods, "Pod", pod, |current, new| {
            new.status = current.status.clone();
        })
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(lock(&self.nodes).clone())
    }
}
