//! Host backed WireGuard device
//!
//! Drives the link through `ip` and `wg`. The private key only ever reaches
//! `wg` on stdin.

use crate::device::{LivePeer, PeerChange, WireguardDevice};
use crate::error::AgentError;
use crate::settings::AgentSettings;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Run a host command and return its stdout.
///
/// # Errors
///
/// Returns [`AgentError::Command`] when the command cannot be spawned or exits
/// non-zero, with stderr as the message.
pub async fn run_command(
    program: &str,
    args: &[&str],
    stdin: Option<&str>,
) -> Result<String, AgentError> {
    let command_line = format!("{program} {}", args.join(" "));
    debug!("Running `{}`", command_line);

    let command_error = |message: String| AgentError::Command {
        command: command_line.clone(),
        message,
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| command_error(e.to_string()))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|e| command_error(e.to_string()))?;
        // Close stdin so the command sees EOF
        drop(pipe);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| command_error(e.to_string()))?;

    if !output.status.success() {
        return Err(command_error(format!(
            "{}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Shell line that prepares the tun device and starts the userspace implementation
#[must_use]
pub fn userspace_command(fallback: &str, interface: &str) -> String {
    format!(
        "mkdir -p /dev/net && if [ ! -c /dev/net/tun ]; then mknod /dev/net/tun c 10 200; fi && {fallback} {interface}"
    )
}

/// Parse `wg show <iface> dump`.
///
/// The first line describes the interface, every following line one peer:
/// public key, preshared key, endpoint, allowed ips, handshake, rx, tx, keepalive.
#[must_use]
pub fn parse_dump(dump: &str) -> Vec<LivePeer> {
    dump.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 4 {
                return None;
            }
            let allowed_ips = match fields[3] {
                "(none)" | "" => Vec::new(),
                ips => ips.split(',').map(|ip| ip.trim().to_string()).collect(),
            };
            Some(LivePeer {
                public_key: fields[0].to_string(),
                allowed_ips,
            })
        })
        .collect()
}

/// Build the `wg set` arguments; the private key is read from stdin
#[must_use]
pub fn wg_set_args(settings: &AgentSettings, changes: &[PeerChange]) -> Vec<String> {
    let mut args = vec![
        "set".to_string(),
        settings.interface.clone(),
        "private-key".to_string(),
        "/dev/stdin".to_string(),
        "listen-port".to_string(),
        settings.listen_port.to_string(),
    ];
    for change in changes {
        match change {
            PeerChange::Remove(key) => {
                args.extend(["peer".to_string(), key.clone(), "remove".to_string()]);
            }
            PeerChange::Update { public_key, allowed_ip }
            | PeerChange::Add { public_key, allowed_ip } => {
                args.extend([
                    "peer".to_string(),
                    public_key.clone(),
                    "allowed-ips".to_string(),
                    allowed_ip.clone(),
                ]);
            }
        }
    }
    args
}

/// [`WireguardDevice`] backed by host commands
#[derive(Debug, Clone, Default)]
pub struct SystemDevice;

impl SystemDevice {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn link_exists(interface: &str) -> bool {
        run_command("ip", &["link", "show", "dev", interface], None)
            .await
            .is_ok()
    }

    async fn start_userspace(settings: &AgentSettings) -> Result<(), AgentError> {
        info!(
            "Starting userspace implementation {} for {}",
            settings.userspace_fallback, settings.interface
        );
        let line = userspace_command(&settings.userspace_fallback, &settings.interface);
        run_command("sh", &["-c", &line], None).await?;
        Ok(())
    }
}

#[async_trait]
impl WireguardDevice for SystemDevice {
    async fn ensure_link(&self, settings: &AgentSettings) -> Result<(), AgentError> {
        let iface = settings.interface.as_str();
        if !Self::link_exists(iface).await {
            if settings.use_userspace {
                Self::start_userspace(settings).await?;
            } else if let Err(e) =
                run_command("ip", &["link", "add", "dev", iface, "type", "wireguard"], None).await
            {
                warn!("Kernel WireGuard unavailable, falling back to userspace: {}", e);
                Self::start_userspace(settings).await?;
            } else {
                info!("Created WireGuard link {}", iface);
            }
        }

        let mtu = settings.mtu.to_string();
        run_command("ip", &["link", "set", "mtu", &mtu, "dev", iface], None).await?;
        run_command("ip", &["link", "set", "up", "dev", iface], None).await?;
        Ok(())
    }

    async fn ensure_address(&self, settings: &AgentSettings) -> Result<(), AgentError> {
        let iface = settings.interface.as_str();

        let addresses = run_command("ip", &["-4", "addr", "show", "dev", iface], None).await?;
        if !addresses.contains("inet ") {
            let gateway = format!("{}/32", settings.gateway);
            run_command("ip", &["addr", "add", &gateway, "dev", iface], None).await?;
            info!("Assigned {} to {}", gateway, iface);
        }

        let routes = run_command("ip", &["-4", "route", "show", "dev", iface], None).await?;
        if routes.trim().is_empty() {
            let pool = settings.pool.to_string();
            run_command("ip", &["route", "add", &pool, "dev", iface], None).await?;
            info!("Routed {} via {}", pool, iface);
        }
        Ok(())
    }

    async fn peers(&self, settings: &AgentSettings) -> Result<Vec<LivePeer>, AgentError> {
        let dump = run_command("wg", &["show", &settings.interface, "dump"], None).await?;
        Ok(parse_dump(&dump))
    }

    async fn configure(
        &self,
        settings: &AgentSettings,
        private_key: &str,
        changes: &[PeerChange],
    ) -> Result<(), AgentError> {
        let args = wg_set_args(settings, changes);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_command("wg", &args, Some(private_key)).await?;
        if !changes.is_empty() {
            info!("Applied {} peer changes to {}", changes.len(), settings.interface);
        }
        Ok(())
    }
}
