//! Sub-resources managed on behalf of a Wireguard relay.
//!
//! The set of kinds is fixed, so they form a closed enum ([`ManagedResource`])
//! rather than a trait object list. Each variant exposes the same protocol:
//!
//! - `name()` / `kind()`: identity recorded in `status.resources`
//! - `create()`: first materialization
//! - `needs_update()`: side-effect-free drift check against live state
//! - `update()`: converge live state back to desired
//! - `converged()`: the sub-resource is observably serving, not merely present
//!
//! The server reconciler walks [`ManagedResource::build`]'s list in order and
//! stops at the first sub-resource that is not converged.

pub mod deployment;
pub mod peers;
pub mod secret;
pub mod service;

pub use deployment::DeploymentResource;
pub use peers::PeerRosterResource;
pub use secret::SecretResource;
pub use service::ServiceResource;

use crate::config::OperatorConfig;
use crate::error::ControllerError;
use crds::Wireguard;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use mesh_store::ObjectStore;
use std::sync::Arc;

/// Shared handles every sub-resource needs
#[derive(Clone)]
pub struct ResourceContext {
    /// Declarative object store
    pub store: Arc<dyn ObjectStore>,
    /// Operator settings
    pub config: Arc<OperatorConfig>,
}

/// Identity of the relay a sub-resource belongs to, resolved once per pass
#[derive(Debug, Clone)]
pub(crate) struct RelayIdentity {
    pub(crate) name: String,
    pub(crate) namespace: String,
    /// `<name>-<uniqueIdentifier>`
    pub(crate) resource_name: String,
    pub(crate) owner: OwnerReference,
}

impl RelayIdentity {
    pub(crate) fn of(wireguard: &Wireguard) -> Result<Self, ControllerError> {
        let name = wireguard.metadata.name.clone()
            .ok_or_else(|| ControllerError::InvalidObject("Wireguard missing name".to_string()))?;
        let namespace = wireguard.metadata.namespace.clone()
            .ok_or_else(|| ControllerError::InvalidObject(format!("Wireguard {} missing namespace", name)))?;
        let suffix = wireguard.status.as_ref()
            .map(|s| s.unique_identifier.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ControllerError::InvalidObject(format!(
                "Wireguard {}/{} has no unique identifier yet", namespace, name
            )))?;
        let owner = wireguard.controller_owner_ref(&())
            .ok_or_else(|| ControllerError::InvalidObject(format!(
                "Wireguard {}/{} has no uid", namespace, name
            )))?;

        Ok(Self {
            resource_name: format!("{}-{}", name, suffix),
            name,
            namespace,
            owner,
        })
    }
}

/// One managed sub-resource of a relay
pub enum ManagedResource {
    /// Relay keys and the agent state blob
    Secret(SecretResource),
    /// UDP exposure of the relay
    Service(ServiceResource),
    /// Relay pod (agent + metrics exporter)
    Deployment(DeploymentResource),
    /// Peer address allocation and rendered client configs
    Peers(PeerRosterResource),
}

impl ManagedResource {
    /// Build the ordered sub-resource list for one reconcile pass.
    ///
    /// `secret_version` is the live resourceVersion of the relay Secret, empty
    /// when the Secret does not exist yet.
    pub fn build(
        wireguard: &Wireguard,
        secret_version: &str,
        ctx: &ResourceContext,
    ) -> Result<Vec<ManagedResource>, ControllerError> {
        let relay = RelayIdentity::of(wireguard)?;
        Ok(vec![
            ManagedResource::Secret(SecretResource::new(wireguard, relay.clone(), ctx.clone())),
            ManagedResource::Service(ServiceResource::new(wireguard, relay.clone(), ctx.clone())),
            ManagedResource::Deployment(DeploymentResource::new(
                wireguard,
                relay.clone(),
                secret_version,
                ctx.clone(),
            )),
            ManagedResource::Peers(PeerRosterResource::new(wireguard, relay, ctx.clone())),
        ])
    }

    /// Object name of the sub-resource
    pub fn name(&self) -> &str {
        match self {
            ManagedResource::Secret(r) => r.name(),
            ManagedResource::Service(r) => r.name(),
            ManagedResource::Deployment(r) => r.name(),
            ManagedResource::Peers(r) => r.name(),
        }
    }

    /// Stable discriminator recorded in `status.resources[].type`
    pub fn kind(&self) -> &'static str {
        match self {
            ManagedResource::Secret(_) => SecretResource::KIND,
            ManagedResource::Service(_) => ServiceResource::KIND,
            ManagedResource::Deployment(_) => DeploymentResource::KIND,
            ManagedResource::Peers(_) => PeerRosterResource::KIND,
        }
    }

    /// Create the sub-resource
    pub async fn create(&self) -> Result<(), ControllerError> {
        match self {
            ManagedResource::Secret(r) => r.create().await,
            ManagedResource::Service(r) => r.create().await,
            ManagedResource::Deployment(r) => r.create().await,
            ManagedResource::Peers(r) => r.create().await,
        }
    }

    /// Bring the live object back to the desired state
    pub async fn update(&self) -> Result<(), ControllerError> {
        match self {
            ManagedResource::Secret(r) => r.update().await,
            ManagedResource::Service(r) => r.update().await,
            ManagedResource::Deployment(r) => r.update().await,
            ManagedResource::Peers(r) => r.update().await,
        }
    }

    /// Whether the live object drifted from the desired state
    pub async fn needs_update(&self) -> Result<bool, ControllerError> {
        match self {
            ManagedResource::Secret(r) => r.needs_update().await,
            ManagedResource::Service(r) => r.needs_update().await,
            ManagedResource::Deployment(r) => r.needs_update().await,
            ManagedResource::Peers(r) => r.needs_update().await,
        }
    }

    /// Whether the sub-resource is serving its purpose, not merely created
    pub async fn converged(&self) -> Result<bool, ControllerError> {
        match self {
            ManagedResource::Secret(r) => r.converged().await,
            ManagedResource::Service(r) => r.converged().await,
            ManagedResource::Deployment(r) => r.converged().await,
            ManagedResource::Peers(r) => r.converged().await,
        }
    }

    /// The Secret variant, if this is one
    pub fn as_secret(&self) -> Option<&SecretResource> {
        match self {
            ManagedResource::Secret(r) => Some(r),
            _ => None,
        }
    }

    /// The Service variant, if this is one
    pub fn as_service(&self) -> Option<&ServiceResource> {
        match self {
            ManagedResource::Service(r) => Some(r),
            _ => None,
        }
    }
}
