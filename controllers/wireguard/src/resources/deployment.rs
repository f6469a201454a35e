//! Relay Deployment: agent container plus metrics exporter.

use super::secret::SECRET_VERSION_ANNOTATION;
use super::{RelayIdentity, ResourceContext};
use crate::config::OperatorConfig;
use crate::error::ControllerError;
use crds::Wireguard;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, PodSpec, PodTemplateSpec,
    SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use mesh_store::StoreResultExt;
use std::collections::BTreeMap;
use tracing::debug;

const AGENT_CONTAINER: &str = "agent";
const METRICS_CONTAINER: &str = "metrics";
const CONFIG_VOLUME: &str = "config";
const SOCKET_VOLUME: &str = "socket";
const SOCKET_DIR: &str = "/var/run/wireguard/";

pub struct DeploymentResource {
    wireguard: Wireguard,
    relay: RelayIdentity,
    secret_version: String,
    ctx: ResourceContext,
}

/// Agent command line; deterministic for a given config and flag
pub fn agent_command(config: &OperatorConfig, use_userspace: bool) -> Vec<String> {
    let mut command = vec![
        "agent".to_string(),
        "--v".to_string(),
        config.agent_verbosity.to_string(),
        "--wg-iface".to_string(),
        config.interface.clone(),
        "--wg-listen-port".to_string(),
        config.wireguard_port.to_string(),
        "--state".to_string(),
        config.state_path(),
        "--wg-userspace-implementation-fallback".to_string(),
        config.userspace_fallback.clone(),
    ];
    if use_userspace {
        command.push("--wg-use-userspace-implementation".to_string());
    }
    command
}

fn net_admin() -> Option<SecurityContext> {
    Some(SecurityContext {
        capabilities: Some(Capabilities {
            add: Some(vec!["NET_ADMIN".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

impl DeploymentResource {
    pub const KIND: &'static str = "Deployment";

    pub(crate) fn new(
        wireguard: &Wireguard,
        relay: RelayIdentity,
        secret_version: &str,
        ctx: ResourceContext,
    ) -> Self {
        Self {
            wireguard: wireguard.clone(),
            relay,
            secret_version: secret_version.to_string(),
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.relay.resource_name
    }

    fn version_annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(SECRET_VERSION_ANNOTATION.to_string(), self.secret_version.clone())])
    }

    fn desired(&self) -> Deployment {
        let config = &self.ctx.config;
        let pod_labels = config.labels(self.name());

        let metrics = Container {
            name: METRICS_CONTAINER.to_string(),
            image: Some(config.metrics_image.clone()),
            image_pull_policy: Some(config.image_pull_policy.clone()),
            command: Some(vec!["/usr/local/bin/prometheus_wireguard_exporter".to_string()]),
            ports: Some(vec![ContainerPort {
                name: Some("metrics".to_string()),
                container_port: config.metrics_port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            security_context: net_admin(),
            volume_mounts: Some(vec![VolumeMount {
                name: SOCKET_VOLUME.to_string(),
                mount_path: SOCKET_DIR.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let agent = Container {
            name: AGENT_CONTAINER.to_string(),
            image: Some(config.agent_image.clone()),
            image_pull_policy: Some(config.image_pull_policy.clone()),
            command: Some(agent_command(config, self.wireguard.spec.use_wg_userspace_implementation)),
            ports: Some(vec![ContainerPort {
                name: Some("wireguard".to_string()),
                container_port: config.wireguard_port,
                protocol: Some("UDP".to_string()),
                ..Default::default()
            }]),
            security_context: net_admin(),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: SOCKET_VOLUME.to_string(),
                    mount_path: SOCKET_DIR.to_string(),
                    ..Default::default()
                },
                VolumeMount {
                    name: CONFIG_VOLUME.to_string(),
                    mount_path: config.state_dir.clone(),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        let init_containers = self.wireguard.spec.enable_ip_forward_on_pod_init.then(|| {
            vec![Container {
                name: "sysctl".to_string(),
                image: Some("busybox".to_string()),
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "echo 1 > /proc/sys/net/ipv4/ip_forward".to_string(),
                ]),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }]
        });

        Deployment {
            metadata: ObjectMeta {
                name: Some(self.name().to_string()),
                namespace: Some(self.relay.namespace.clone()),
                labels: Some(config.labels(&self.relay.name)),
                annotations: Some(self.version_annotations()),
                owner_references: Some(vec![self.relay.owner.clone()]),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(pod_labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    // The secret version stays off the template so a new blob reloads the running pod
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        init_containers,
                        containers: vec![metrics, agent],
                        volumes: Some(vec![
                            Volume {
                                name: SOCKET_VOLUME.to_string(),
                                empty_dir: Some(EmptyDirVolumeSource::default()),
                                ..Default::default()
                            },
                            Volume {
                                name: CONFIG_VOLUME.to_string(),
                                secret: Some(SecretVolumeSource {
                                    secret_name: Some(self.name().to_string()),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn live(&self) -> Result<Option<Deployment>, ControllerError> {
        Ok(self.ctx.store
            .get_deployment(&self.relay.namespace, self.name())
            .await
            .found()?)
    }

    pub async fn create(&self) -> Result<(), ControllerError> {
        self.ctx.store.create_deployment(&self.desired()).await?;
        Ok(())
    }

    pub async fn needs_update(&self) -> Result<bool, ControllerError> {
        let Some(live) = self.live().await? else {
            return Ok(true);
        };
        let desired = self.desired();

        let drift = [
            ("image", agent(&live).and_then(|c| c.image.as_ref()) != agent(&desired).and_then(|c| c.image.as_ref())),
            ("command", agent(&live).and_then(|c| c.command.as_ref()) != agent(&desired).and_then(|c| c.command.as_ref())),
            ("secret", config_secret(&live) != config_secret(&desired)),
            ("secret version", secret_version(&live) != Some(self.secret_version.as_str())),
        ];
        let changed: Vec<&str> = drift.iter().filter(|(_, d)| *d).map(|(what, _)| *what).collect();
        if !changed.is_empty() {
            debug!(
                "Deployment {}/{} drifted: {}",
                self.relay.namespace,
                self.name(),
                changed.join(", ")
            );
        }
        Ok(!changed.is_empty())
    }

    pub async fn update(&self) -> Result<(), ControllerError> {
        let Some(live) = self.live().await? else {
            return self.create().await;
        };
        let mut desired = self.desired();
        desired.metadata.resource_version.clone_from(&live.metadata.resource_version);
        self.ctx.store.update_deployment(&desired).await?;
        Ok(())
    }

    pub async fn converged(&self) -> Result<bool, ControllerError> {
        let Some(live) = self.live().await? else {
            return Ok(false);
        };
        let desired = live.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let ready = live.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
        Ok(ready == desired)
    }
}

fn pod_spec(deployment: &Deployment) -> Option<&PodSpec> {
    deployment.spec.as_ref()?.template.spec.as_ref()
}

fn agent(deployment: &Deployment) -> Option<&Container> {
    pod_spec(deployment)?.containers.iter().find(|c| c.name == AGENT_CONTAINER)
}

fn config_secret(deployment: &Deployment) -> Option<&str> {
    pod_spec(deployment)?
        .volumes.as_ref()?
        .iter()
        .find(|v| v.name == CONFIG_VOLUME)?
        .secret.as_ref()?
        .secret_name.as_deref()
}

fn secret_version(deployment: &Deployment) -> Option<&str> {
    deployment.metadata.annotations.as_ref()?
        .get(SECRET_VERSION_ANNOTATION)
        .map(String::as_str)
}
