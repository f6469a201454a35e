//! Agent settings
//!
//! Built from command line flags. The operator passes the flag set in the
//! relay pod spec, anything it leaves out falls back to the defaults below.

use clap::Parser;
use ipnetwork::Ipv4Network;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Command line flags of the agent binary
#[derive(Debug, Parser)]
#[command(name = "agent", about = "Applies the relay state file to the WireGuard device")]
pub struct Args {
    /// Path of the state file written by the operator
    #[arg(long = "state", default_value = "/tmp/wireguard/state.json")]
    pub state: PathBuf,

    /// WireGuard network interface
    #[arg(long = "wg-iface", default_value = "wg0")]
    pub wg_iface: String,

    /// WireGuard UDP listen port
    #[arg(long = "wg-listen-port", default_value_t = 51820)]
    pub wg_listen_port: u16,

    /// Skip the kernel module and start the userspace implementation
    #[arg(long = "wg-use-userspace-implementation")]
    pub wg_use_userspace_implementation: bool,

    /// Userspace implementation binary
    #[arg(long = "wg-userspace-implementation-fallback", default_value = "wireguard-go")]
    pub wg_userspace_implementation_fallback: String,

    /// Log verbosity, 0-1 info, 2-5 debug, above 5 trace
    #[arg(short = 'v', long = "v", default_value_t = 0)]
    pub verbosity: u8,

    /// Listen address of the health endpoint
    #[arg(long = "health-addr", default_value = "0.0.0.0:8080")]
    pub health_addr: SocketAddr,

    /// Relay address on the tunnel
    #[arg(long = "gateway", default_value = "10.8.0.1")]
    pub gateway: Ipv4Addr,

    /// Tunnel address pool
    #[arg(long = "pool", default_value = "10.8.0.0/24")]
    pub pool: Ipv4Network,

    /// Interface peer traffic is masqueraded out of
    #[arg(long = "egress-iface", default_value = "eth0")]
    pub egress_iface: String,

    /// MTU of the WireGuard link
    #[arg(long = "mtu", default_value_t = 1420)]
    pub mtu: u32,
}

impl Args {
    /// Resolve flags into runtime settings
    #[must_use]
    pub fn into_settings(self) -> AgentSettings {
        AgentSettings {
            interface: self.wg_iface,
            listen_port: self.wg_listen_port,
            state_path: self.state,
            use_userspace: self.wg_use_userspace_implementation,
            userspace_fallback: self.wg_userspace_implementation_fallback,
            gateway: self.gateway,
            pool: self.pool,
            egress_interface: self.egress_iface,
            mtu: self.mtu,
            health_addr: self.health_addr,
        }
    }
}

/// Runtime settings shared by the sync, watch and health components
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub interface: String,
    pub listen_port: u16,
    pub state_path: PathBuf,
    pub use_userspace: bool,
    pub userspace_fallback: String,
    pub gateway: Ipv4Addr,
    pub pool: Ipv4Network,
    pub egress_interface: String,
    pub mtu: u32,
    pub health_addr: SocketAddr,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            listen_port: 51820,
            state_path: PathBuf::from("/tmp/wireguard/state.json"),
            use_userspace: false,
            userspace_fallback: "wireguard-go".to_string(),
            gateway: Ipv4Addr::new(10, 8, 0, 1),
            pool: Ipv4Network::new(Ipv4Addr::new(10, 8, 0, 0), 24)
                .unwrap_or_else(|_| unreachable!("10.8.0.0/24 is a valid network")),
            egress_interface: "eth0".to_string(),
            mtu: 1420,
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl AgentSettings {
    /// Directory holding the state file, watched instead of the file itself
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        parent_dir(&self.state_path)
    }
}

/// Parent directory of `path`, the working directory for bare file names
#[must_use]
pub fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Map a verbosity level onto a tracing filter directive
#[must_use]
pub fn log_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 | 1 => "info",
        2..=5 => "debug",
        _ => "trace",
    }
}
