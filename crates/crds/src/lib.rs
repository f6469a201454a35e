//! Wireguard Operator CRD Definitions
//!
//! Kubernetes Custom Resource Definitions shared by the operator and the
//! node-side relay agent, plus the state blob the operator hands to the agent.

pub mod phase;
pub mod wireguard;
pub mod wireguard_peer;
pub mod state;

pub use phase::*;
pub use wireguard::*;
pub use wireguard_peer::*;
pub use state::*;

/// API group of every CRD in this crate
pub const API_GROUP: &str = "vpn.wgmesh.io";
