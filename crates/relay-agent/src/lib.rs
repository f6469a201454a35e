//! Relay Agent
//!
//! Runs beside the WireGuard relay and keeps the node in line with the state
//! file the operator writes into the relay Secret:
//! - watches the state file directory and re-applies on every content change
//! - syncs the network link, its address and route
//! - reconfigures device peers by diff, never wholesale
//! - regenerates and atomically applies the egress packet filter
//! - serves `/health` for the kubelet

pub mod device;
pub mod error;
pub mod firewall;
pub mod health;
pub mod settings;
pub mod state_file;
pub mod sync;
pub mod system;
pub mod watcher;

#[cfg(test)]
mod fakes;

pub use error::AgentError;
pub use settings::AgentSettings;
pub use sync::Syncer;
