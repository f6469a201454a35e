//! Wireguard relay reconciliation.
//!
//! One pass walks the managed sub-resources in dependency order (Secret,
//! Service, Deployment, Peers) and takes at most one corrective step. Once
//! every sub-resource converged, the resolved public key, endpoint and DNS
//! are published on the relay status.

use super::{object_key, unique_identifier, Outcome, Reconciler};
use crate::error::ControllerError;
use crate::resources::ManagedResource;
use crds::{ManagedResourceStatus, Phase, ServiceType, Wireguard, WireguardStatus};
use mesh_store::StoreResultExt;
use tracing::{debug, info, warn};

/// Status message of a fully converged relay
pub const VPN_ACTIVE: &str = "VPN is active!";
/// Status message when a NodePort relay has no reachable node address
pub const NO_NODE_ADDRESS: &str =
    "Unable to determine WG address though nodes addresses. Please set Wireguard.Spec.Address if necessary.";

const CLUSTER_DNS_NAMESPACE: &str = "kube-system";
const CLUSTER_DNS_SERVICE: &str = "kube-dns";

impl Reconciler {
    /// Reconcile one Wireguard relay.
    pub async fn reconcile_wireguard(&self, namespace: &str, name: &str) -> Result<Outcome, ControllerError> {
        let key = object_key(namespace, name);
        let Some(mut wireguard) = self.store.get_wireguard(namespace, name).await.found()? else {
            debug!("Wireguard {} not found, must have been deleted", key);
            return Ok(Outcome::AwaitChange);
        };

        let status = wireguard.status.get_or_insert_with(WireguardStatus::default);
        if status.status.is_none() || status.unique_identifier.is_empty() {
            if status.unique_identifier.is_empty() {
                status.unique_identifier = unique_identifier();
            }
            status.status = Some(Phase::Pending);
            status.message = "Fetching Wireguard status".to_string();
            info!("Initializing Wireguard {} (instance {})", key, status.unique_identifier);
            self.store.update_wireguard_status(&wireguard).await?;
            return Ok(Outcome::Requeue);
        }

        let resource_name = format!("{}-{}", name, status.unique_identifier);
        let secret_version = self.store
            .get_secret(namespace, &resource_name)
            .await
            .found()?
            .and_then(|s| s.metadata.resource_version)
            .unwrap_or_default();

        let resources = ManagedResource::build(&wireguard, &secret_version, &self.context())?;
        for resource in &resources {
            if let Some(outcome) = self.step(&mut wireguard, resource).await? {
                return Ok(outcome);
            }
        }

        self.publish_endpoint(&mut wireguard, &resources).await
    }

    /// Drive one sub-resource. `Some` ends the pass with that outcome.
    async fn step(
        &self,
        wireguard: &mut Wireguard,
        resource: &ManagedResource,
    ) -> Result<Option<Outcome>, ControllerError> {
        let (name, kind) = (resource.name().to_string(), resource.kind());
        let namespace = wireguard.metadata.namespace.clone().unwrap_or_default();
        let status = wireguard.status.get_or_insert_with(WireguardStatus::default);

        let Some(recorded) = status.resource(&name, kind).map(|r| r.status) else {
            info!("Creating {} {}/{}", kind, namespace, name);
            match resource.create().await {
                Err(e) if e.is_conflict() => debug!("{} {}/{} already exists", kind, namespace, name),
                other => other?,
            }
            status.resources.push(ManagedResourceStatus {
                name: name.clone(),
                kind: kind.to_string(),
                status: Phase::Pending,
            });
            status.status = Some(Phase::Pending);
            status.message = format!("Waiting for {} {} to be created", kind, name);
            self.store.update_wireguard_status(wireguard).await?;
            return Ok(Some(Outcome::Requeue));
        };

        if resource.needs_update().await? {
            info!("Updating {} {}/{}", kind, namespace, name);
            resource.update().await?;
            return Ok(Some(Outcome::Requeue));
        }

        if !resource.converged().await? {
            let message = format!("Waiting for {} {} to be ready", kind, name);
            if status.status != Some(Phase::Pending) || status.message != message {
                status.status = Some(Phase::Pending);
                status.message = message;
                self.store.update_wireguard_status(wireguard).await?;
            }
            debug!("{} {}/{} not converged yet", kind, namespace, name);
            return Ok(Some(Outcome::AwaitChange));
        }

        if recorded != Phase::Ready {
            if let Some(entry) = status.resource_mut(&name, kind) {
                entry.status = Phase::Ready;
            }
            info!("{} {}/{} is ready", kind, namespace, name);
            self.store.update_wireguard_status(wireguard).await?;
            return Ok(Some(Outcome::Requeue));
        }

        Ok(None)
    }

    /// Publish public key, endpoint and DNS once every sub-resource converged
    async fn publish_endpoint(
        &self,
        wireguard: &mut Wireguard,
        resources: &[ManagedResource],
    ) -> Result<Outcome, ControllerError> {
        let key = object_key(
            wireguard.metadata.namespace.as_deref().unwrap_or_default(),
            wireguard.metadata.name.as_deref().unwrap_or_default(),
        );

        let public_key = match resources.iter().find_map(ManagedResource::as_secret) {
            Some(secret) => secret.public_key().await?,
            None => None,
        };
        let endpoint = match resources.iter().find_map(ManagedResource::as_service) {
            Some(service) => service.address_and_port().await?,
            None => None,
        };
        let (dns, search_domain) = self.resolve_dns(wireguard).await?;
        let service_type = wireguard.spec.service_type;
        let status = wireguard.status.get_or_insert_with(WireguardStatus::default);

        if let Some(public_key) = public_key {
            if status.public_key != public_key {
                info!("Publishing public key of Wireguard {}", key);
                status.public_key = public_key;
                status.status = Some(Phase::Pending);
                status.message = "Updating public key".to_string();
                self.store.update_wireguard_status(wireguard).await?;
                return Ok(Outcome::Requeue);
            }
        }

        let Some(endpoint) = endpoint else {
            if service_type == ServiceType::NodePort {
                warn!("No node address found for Wireguard {}", key);
                if status.status != Some(Phase::Pending) || status.message != NO_NODE_ADDRESS {
                    status.status = Some(Phase::Pending);
                    status.message = NO_NODE_ADDRESS.to_string();
                    self.store.update_wireguard_status(wireguard).await?;
                }
                return Ok(Outcome::RequeueAfter(self.config.node_address_retry));
            }
            debug!("Endpoint of Wireguard {} not resolved yet", key);
            return Ok(Outcome::AwaitChange);
        };
        if status.address != endpoint.address || status.port != endpoint.port {
            info!("Wireguard {} reachable at {}:{}", key, endpoint.address, endpoint.port);
            status.address = endpoint.address;
            status.port = endpoint.port;
            status.status = Some(Phase::Pending);
            status.message = "Updating endpoint".to_string();
            self.store.update_wireguard_status(wireguard).await?;
            return Ok(Outcome::Requeue);
        }

        if status.status != Some(Phase::Ready)
            || status.dns != dns
            || status.dns_search_domain != search_domain
        {
            status.dns = dns;
            status.dns_search_domain = search_domain;
            status.status = Some(Phase::Ready);
            status.message = VPN_ACTIVE.to_string();
            info!("Wireguard {} is ready", key);
            self.store.update_wireguard_status(wireguard).await?;
            return Ok(Outcome::Requeue);
        }

        Ok(Outcome::AwaitChange)
    }

    /// DNS handed to peers and its search domain.
    ///
    /// `spec.dns` wins; otherwise the cluster DNS Service, otherwise the
    /// configured fallback.
    pub(crate) async fn resolve_dns(&self, wireguard: &Wireguard) -> Result<(String, String), ControllerError> {
        if let Some(dns) = wireguard.spec.dns.as_deref().filter(|d| !d.is_empty()) {
            return Ok((dns.to_string(), String::new()));
        }

        let cluster_ip = self.store
            .get_service(CLUSTER_DNS_NAMESPACE, CLUSTER_DNS_SERVICE)
            .await
            .found()?
            .and_then(|svc| svc.spec?.cluster_ip)
            .filter(|ip| !ip.is_empty() && ip != "None");

        Ok(match cluster_ip {
            Some(ip) => (
                ip,
                format!(
                    "{}.svc.cluster.local",
                    wireguard.metadata.namespace.as_deref().unwrap_or_default()
                ),
            ),
            None => {
                debug!("No cluster DNS found, using {}", self.config.fallback_dns);
                (self.config.fallback_dns.clone(), String::new())
            }
        })
    }
}
