//! Relay Service: exposes the single UDP port.

use super::{RelayIdentity, ResourceContext};
use crate::error::ControllerError;
use crds::{ServiceType, Wireguard};
use k8s_openapi::api::core::v1::{Node, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use mesh_store::StoreResultExt;
use tracing::debug;

/// Where peers reach the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub port: String,
}

pub struct ServiceResource {
    wireguard: Wireguard,
    relay: RelayIdentity,
    ctx: ResourceContext,
}

impl ServiceResource {
    pub const KIND: &'static str = "Service";

    pub(crate) fn new(wireguard: &Wireguard, relay: RelayIdentity, ctx: ResourceContext) -> Self {
        Self {
            wireguard: wireguard.clone(),
            relay,
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.relay.resource_name
    }

    fn service_type(&self) -> ServiceType {
        self.wireguard.spec.service_type
    }

    fn fixed_address(&self) -> Option<&str> {
        self.wireguard.spec.address.as_deref().filter(|a| !a.is_empty())
    }

    fn desired(&self) -> Service {
        let spec = &self.wireguard.spec;
        let port = self.ctx.config.wireguard_port;
        let annotations = (!spec.service_annotations.is_empty())
            .then(|| spec.service_annotations.clone());

        Service {
            metadata: ObjectMeta {
                name: Some(self.name().to_string()),
                namespace: Some(self.relay.namespace.clone()),
                labels: Some(self.ctx.config.labels(&self.relay.name)),
                annotations,
                owner_references: Some(vec![self.relay.owner.clone()]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(self.service_type().as_str().to_string()),
                selector: Some(self.ctx.config.labels(self.name())),
                load_balancer_ip: self.fixed_address().map(str::to_string),
                ports: Some(vec![ServicePort {
                    name: Some("wireguard".to_string()),
                    protocol: Some("UDP".to_string()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    node_port: spec.node_port.filter(|p| *p != 0),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn live(&self) -> Result<Option<Service>, ControllerError> {
        Ok(self.ctx.store
            .get_service(&self.relay.namespace, self.name())
            .await
            .found()?)
    }

    pub async fn create(&self) -> Result<(), ControllerError> {
        self.ctx.store.create_service(&self.desired()).await?;
        Ok(())
    }

    // Services are not updated in place.
    // TODO: diff ports and annotations once a Service update path exists.
    pub async fn needs_update(&self) -> Result<bool, ControllerError> {
        Ok(false)
    }

    pub async fn update(&self) -> Result<(), ControllerError> {
        Ok(())
    }

    pub async fn converged(&self) -> Result<bool, ControllerError> {
        let Some(live) = self.live().await? else {
            return Ok(false);
        };
        let converged = match self.service_type() {
            ServiceType::LoadBalancer => first_ingress(&live).is_some(),
            ServiceType::NodePort => assigned_node_port(&live).is_some(),
            ServiceType::ClusterIp => true,
        };
        if !converged {
            debug!("Service {}/{} has no reachable endpoint yet", self.relay.namespace, self.name());
        }
        Ok(converged)
    }

    /// Resolve the address and port peers should connect to.
    ///
    /// Returns `None` when nothing can be resolved yet: no ingress, no node
    /// port, or no node address for a NodePort relay.
    pub async fn address_and_port(&self) -> Result<Option<Endpoint>, ControllerError> {
        let Some(live) = self.live().await? else {
            return Ok(None);
        };
        let default_port = self.ctx.config.wireguard_port.to_string();

        let endpoint = match self.service_type() {
            ServiceType::LoadBalancer => {
                let address = match self.fixed_address() {
                    Some(address) => Some(address.to_string()),
                    None => first_ingress(&live),
                };
                address.map(|address| Endpoint { address, port: default_port })
            }
            ServiceType::NodePort => {
                let Some(node_port) = assigned_node_port(&live) else {
                    return Ok(None);
                };
                let address = match self.fixed_address() {
                    Some(address) => Some(address.to_string()),
                    None => node_address(&self.ctx.store.list_nodes().await?),
                };
                address.map(|address| Endpoint { address, port: node_port.to_string() })
            }
            ServiceType::ClusterIp => {
                let address = match self.fixed_address() {
                    Some(address) => Some(address.to_string()),
                    None => live.spec.as_ref()
                        .and_then(|s| s.cluster_ip.clone())
                        .filter(|ip| !ip.is_empty() && ip != "None"),
                };
                address.map(|address| Endpoint { address, port: default_port })
            }
        };
        Ok(endpoint)
    }
}

/// Hostname preferred over IP
fn first_ingress(service: &Service) -> Option<String> {
    let ingress = service.status.as_ref()?
        .load_balancer.as_ref()?
        .ingress.as_ref()?
        .first()?;
    ingress.hostname.clone()
        .filter(|h| !h.is_empty())
        .or_else(|| ingress.ip.clone().filter(|ip| !ip.is_empty()))
}

fn assigned_node_port(service: &Service) -> Option<i32> {
    service.spec.as_ref()?
        .ports.as_ref()?
        .iter()
        .find_map(|p| p.node_port.filter(|port| *port != 0))
}

/// First ExternalIP across all nodes, else the first InternalIP
pub(crate) fn node_address(nodes: &[Node]) -> Option<String> {
    let addresses: Vec<_> = nodes
        .iter()
        .filter_map(|n| n.status.as_ref()?.addresses.as_ref())
        .flatten()
        .collect();

    ["ExternalIP", "InternalIP"].iter().find_map(|kind| {
        addresses
            .iter()
            .find(|a| a.type_ == *kind && !a.address.is_empty())
            .map(|a| a.address.clone())
    })
}
