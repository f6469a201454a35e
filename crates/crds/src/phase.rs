//! Lifecycle phase shared by Wireguard, WireguardPeer and managed sub-resources.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
/// Lifecycle phase
///
/// Serializes lowercase ("pending", "ready", "error") to stay compatible with
/// objects already stored in clusters, and accepts PascalCase on input.
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Waiting on a dependency or on a sub-resource to converge
    #[default]
    #[serde(alias = "Pending")]
    Pending,

    /// Fully converged
    #[serde(alias = "Ready")]
    Ready,

    /// A dependency is missing or misconfigured
    #[serde(alias = "Error")]
    Error,
}

impl Phase {
    /// Wire representation of the phase
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Ready => "ready",
            Phase::Error => "error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
