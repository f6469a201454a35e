//! Kubernetes resource watchers.
//!
//! This module handles watching Kubernetes resources for changes
//! and triggering reconciliation using kube_runtime::Controller.
//!
//! - Wireguard: owns its Secret, Service and Deployment, and is re-triggered
//!   by any WireguardPeer that references it
//! - WireguardPeer: owns its key Secret, and is re-triggered when the
//!   referenced Wireguard changes

use crate::error::ControllerError;
use crate::reconciler::{object_key, Reconciler};
use crds::{Wireguard, WireguardPeer};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{Controller, watcher, controller::{Action, Config as ControllerConfig}};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Requeue delay after an optimistic concurrency conflict
const CONFLICT_RETRY: Duration = Duration::from_secs(1);

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Conflicts retry promptly; everything else backs off per object
fn error_policy<K>(obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>) -> Action
where
    K: Resource + Debug,
{
    let key = object_key(
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default(),
    );
    if error.is_conflict() {
        warn!("Conflict while reconciling {}, retrying: {}", key, error);
        return Action::requeue(CONFLICT_RETRY);
    }
    let delay = ctx.next_backoff(&key);
    error!("Reconciliation failed for {}: {} (retry in {:?})", key, error, delay);
    Action::requeue(delay)
}

async fn reconcile_wireguard(obj: Arc<Wireguard>, ctx: Arc<Reconciler>) -> Result<Action, ControllerError> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    debug!("Reconciling Wireguard {}/{}", namespace, name);
    let outcome = ctx.reconcile_wireguard(&namespace, &name).await?;
    ctx.reset_backoff(&object_key(&namespace, &name));
    Ok(outcome.into_action())
}

async fn reconcile_peer(obj: Arc<WireguardPeer>, ctx: Arc<Reconciler>) -> Result<Action, ControllerError> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    debug!("Reconciling WireguardPeer {}/{}", namespace, name);
    let outcome = ctx.reconcile_peer(&namespace, &name).await?;
    ctx.reset_backoff(&object_key(&namespace, &name));
    Ok(outcome.into_action())
}

/// Watches Kubernetes resources for changes.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    client: Client,
    namespace: Option<String>,
    controller_config: ControllerConfig,
}

impl Watcher {
    /// Creates a new watcher instance.
    ///
    /// Debounce batches bursts of events (status writes, owned object
    /// updates) into one reconcile; concurrency bounds parallel reconciles
    /// per resource kind.
    pub fn new(reconciler: Arc<Reconciler>, client: Client, namespace: Option<String>) -> Self {
        Self {
            reconciler,
            client,
            namespace,
            controller_config: ControllerConfig::default()
                .debounce(Duration::from_secs(1))
                .concurrency(3),
        }
    }

    fn ns(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Starts watching Wireguard resources.
    pub async fn watch_wireguards(&self) -> Result<(), ControllerError> {
        info!("Starting Wireguard watcher");
        let cfg = watcher::Config::default();

        Controller::new(api::<Wireguard>(&self.client, self.ns()), cfg.clone())
            .owns(api::<Secret>(&self.client, self.ns()), cfg.clone())
            .owns(api::<Service>(&self.client, self.ns()), cfg.clone())
            .owns(api::<Deployment>(&self.client, self.ns()), cfg.clone())
            .watches(api::<WireguardPeer>(&self.client, self.ns()), cfg, |peer: WireguardPeer| {
                let namespace = peer.namespace()?;
                (!peer.spec.wireguard_ref.is_empty())
                    .then(|| ObjectRef::<Wireguard>::new(&peer.spec.wireguard_ref).within(&namespace))
            })
            .with_config(self.controller_config.clone())
            .run(reconcile_wireguard, error_policy, self.reconciler.clone())
            .for_each(|res| async move {
                if let Err(e) = res {
                    error!("Controller error for Wireguard: {}", e);
                }
            })
            .await;

        Ok(())
    }

    /// Starts watching WireguardPeer resources.
    pub async fn watch_peers(&self) -> Result<(), ControllerError> {
        info!("Starting WireguardPeer watcher");
        let cfg = watcher::Config::default();

        let controller = Controller::new(api::<WireguardPeer>(&self.client, self.ns()), cfg.clone());
        let peers = controller.store();

        controller
            .owns(api::<Secret>(&self.client, self.ns()), cfg.clone())
            .watches(api::<Wireguard>(&self.client, self.ns()), cfg, move |wireguard: Wireguard| {
                let name = wireguard.name_any();
                let namespace = wireguard.namespace();
                peers
                    .state()
                    .into_iter()
                    .filter(|p| p.spec.wireguard_ref == name && p.namespace() == namespace)
                    .map(|p| ObjectRef::from_obj(&*p))
                    .collect::<Vec<_>>()
            })
            .with_config(self.controller_config.clone())
            .run(reconcile_peer, error_policy, self.reconciler.clone())
            .for_each(|res| async move {
                if let Err(e) = res {
                    error!("Controller error for WireguardPeer: {}", e);
                }
            })
            .await;

        Ok(())
    }
}
