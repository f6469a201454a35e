//! Controller-specific error types.
//!
//! This module defines error types specific to the Wireguard Controller
//! that are not covered by upstream library errors.

use kube::Error as KubeError;
use mesh_store::StoreError;
use thiserror::Error;

/// Errors that can occur in the Wireguard Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes client setup error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Object store read or write failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Object is missing data the controller needs
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Optimistic concurrency conflicts are expected under concurrent
    /// reconciles and only need a retry
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Store(e) if e.is_conflict())
    }
}
