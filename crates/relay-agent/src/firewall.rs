//! Egress packet filter
//!
//! Every active peer gets its own chain. Forwarded traffic from the peer jumps
//! into it, where ICMP to the relay, traffic to the peer itself and DNS are
//! always accepted, followed by the peer's egress policies. When a peer has
//! policies, anything they do not match is rejected. The whole document is
//! applied through `iptables-restore` in one step.

use crate::error::AgentError;
use crate::settings::AgentSettings;
use crate::system::run_command;
use async_trait::async_trait;
use crds::{EgressNetworkPolicy, PolicyAction, State};
use tracing::info;

/// Chain name for a peer address, dots replaced by dashes
#[must_use]
pub fn chain_name(peer_ip: &str) -> String {
    peer_ip.replace('.', "-")
}

/// Rules for a single egress policy.
///
/// A port without a protocol expands into a TCP and a UDP rule. Policies
/// without an action reject.
#[must_use]
pub fn generate_policy_rules(chain: &str, policy: &EgressNetworkPolicy) -> Vec<String> {
    let target = policy.action.unwrap_or(PolicyAction::Reject).target();
    let ip = policy.to.as_ref().and_then(|to| to.ip.as_deref()).filter(|ip| !ip.is_empty());
    let port = policy.to.as_ref().and_then(|to| to.port).filter(|port| *port > 0);

    let protocols: Vec<&str> = match (policy.protocol, port) {
        (Some(protocol), _) => vec![protocol.as_str()],
        (None, Some(_)) => vec!["TCP", "UDP"],
        (None, None) => vec![""],
    };

    protocols
        .into_iter()
        .map(|protocol| {
            let mut parts = vec![format!("-A {chain}")];
            if let Some(ip) = ip {
                parts.push(format!("-d {ip}"));
            }
            if !protocol.is_empty() {
                parts.push(format!("-p {protocol}"));
            }
            if let Some(port) = port {
                parts.push(format!("--dport {port}"));
            }
            parts.push(format!("-j {target}"));
            parts.join(" ")
        })
        .collect()
}

/// Filter block for one peer
#[must_use]
pub fn generate_rules(
    peer_ip: &str,
    dns: &str,
    server_ip: &str,
    policies: &[EgressNetworkPolicy],
) -> String {
    let chain = chain_name(peer_ip);
    let mut lines = vec![
        format!("# start of rules for peer {peer_ip}"),
        format!(":{chain} - [0:0]"),
        format!("-A FORWARD -s {peer_ip} -j {chain}"),
        format!("-A {chain} -d {server_ip} -p icmp -j ACCEPT"),
        format!("-A {chain} -d {peer_ip} -j ACCEPT"),
        format!("-A {chain} -d {dns} -p UDP --dport 53 -j ACCEPT"),
    ];
    for policy in policies {
        lines.extend(generate_policy_rules(&chain, policy));
    }
    if !policies.is_empty() {
        lines.push(format!("-A {chain} -j REJECT --reject-with icmp-port-unreachable"));
    }
    lines.push(format!("# end of rules for peer {peer_ip}"));
    lines.join("\n")
}

/// Full `iptables-restore` document: pool masquerade plus a filter block per
/// active peer
#[must_use]
pub fn generate_table(state: &State, settings: &AgentSettings) -> String {
    let mut lines = vec![
        "*nat".to_string(),
        ":PREROUTING ACCEPT [0:0]".to_string(),
        ":INPUT ACCEPT [0:0]".to_string(),
        ":OUTPUT ACCEPT [0:0]".to_string(),
        ":POSTROUTING ACCEPT [0:0]".to_string(),
        format!(
            "-A POSTROUTING -s {} -o {} -j MASQUERADE",
            settings.pool, settings.egress_interface
        ),
        "COMMIT".to_string(),
        "*filter".to_string(),
        ":INPUT ACCEPT [0:0]".to_string(),
        ":FORWARD ACCEPT [0:0]".to_string(),
        ":OUTPUT ACCEPT [0:0]".to_string(),
    ];

    for peer in state.peers.iter().filter(|peer| peer.is_active()) {
        let Some(address) = peer.address() else {
            continue;
        };
        lines.push(generate_rules(
            address,
            state.dns(),
            state.server_address(),
            &peer.spec.egress_network_policies,
        ));
    }

    lines.push("COMMIT".to_string());
    let mut table = lines.join("\n");
    table.push('\n');
    table
}

/// Packet filter backend
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Replace the managed tables with `table` atomically
    async fn apply(&self, table: &str) -> Result<(), AgentError>;
}

/// [`Firewall`] that pipes the document into `iptables-restore`
#[derive(Debug, Clone, Default)]
pub struct IptablesRestore;

impl IptablesRestore {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Firewall for IptablesRestore {
    async fn apply(&self, table: &str) -> Result<(), AgentError> {
        run_command("iptables-restore", &[], Some(table)).await?;
        info!("Packet filter updated");
        Ok(())
    }
}
