//! Operator configuration.
//!
//! Built once at startup from environment variables and shared read-only
//! (`Arc<OperatorConfig>`) with every reconciler and managed sub-resource.

use crate::error::ControllerError;
use ipnetwork::Ipv4Network;
use std::collections::BTreeMap;
use std::env;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Label key/value shared by every object the operator manages
pub const APP_LABEL: (&str, &str) = ("app", "wireguard");

/// Immutable operator settings
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// UDP port the relay listens on
    pub wireguard_port: i32,
    /// TCP port of the metrics exporter sidecar
    pub metrics_port: i32,
    /// Pool peer addresses are allocated from
    pub pool: Ipv4Network,
    /// Relay tunnel address, reserved in the pool
    pub gateway: Ipv4Addr,
    /// DNS handed to peers when neither the spec nor the cluster provides one
    pub fallback_dns: String,
    /// Relay agent image
    pub agent_image: String,
    /// Pull policy for the relay pod images
    pub image_pull_policy: String,
    /// Metrics exporter image
    pub metrics_image: String,
    /// Tunnel interface inside the relay pod
    pub interface: String,
    /// Directory the state Secret is mounted at
    pub state_dir: String,
    /// Userspace implementation used when the kernel module is unavailable
    pub userspace_fallback: String,
    /// Verbosity passed to the agent
    pub agent_verbosity: u8,
    /// Namespace to watch, all namespaces when `None`
    pub watch_namespace: Option<String>,
    /// Deadline for each object store call
    pub store_timeout: Duration,
    /// Retry delay when no node address can be resolved for a NodePort relay
    pub node_address_retry: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            wireguard_port: 51820,
            metrics_port: 9586,
            pool: Ipv4Network::new(Ipv4Addr::new(10, 8, 0, 0), 24)
                .unwrap_or_else(|_| unreachable!("10.8.0.0/24 is a valid network")),
            gateway: Ipv4Addr::new(10, 8, 0, 1),
            fallback_dns: "1.1.1.1".to_string(),
            agent_image: "ghcr.io/wgmesh/agent:latest".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            metrics_image: "docker.io/mindflavor/prometheus-wireguard-exporter:3.6.6".to_string(),
            interface: "wg0".to_string(),
            state_dir: "/tmp/wireguard/".to_string(),
            userspace_fallback: "wireguard-go".to_string(),
            agent_verbosity: 11,
            watch_namespace: None,
            store_timeout: Duration::from_secs(30),
            node_address_retry: Duration::from_secs(60),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary lookup (environment in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(image) = lookup("AGENT_IMAGE") {
            config.agent_image = image;
        }
        if let Some(policy) = lookup("AGENT_IMAGE_PULL_POLICY") {
            match policy.as_str() {
                "Always" | "IfNotPresent" | "Never" => config.image_pull_policy = policy,
                other => {
                    return Err(ControllerError::InvalidConfig(format!(
                        "AGENT_IMAGE_PULL_POLICY must be Always, IfNotPresent or Never, got '{}'",
                        other
                    )));
                }
            }
        }
        if let Some(image) = lookup("METRICS_IMAGE") {
            config.metrics_image = image;
        }
        config.watch_namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty());
        if let Some(seconds) = lookup("STORE_TIMEOUT_SECONDS") {
            let seconds: u64 = seconds.parse().map_err(|_| {
                ControllerError::InvalidConfig(format!(
                    "STORE_TIMEOUT_SECONDS must be a number of seconds, got '{}'",
                    seconds
                ))
            })?;
            config.store_timeout = Duration::from_secs(seconds);
        }

        Ok(config)
    }

    /// Path of the state blob inside the relay pod
    #[must_use]
    pub fn state_path(&self) -> String {
        format!("{}state.json", self.state_dir)
    }

    /// Standard labels for objects belonging to `instance`
    #[must_use]
    pub fn labels(&self, instance: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (APP_LABEL.0.to_string(), APP_LABEL.1.to_string()),
            ("instance".to_string(), instance.to_string()),
        ])
    }
}
