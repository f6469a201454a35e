//! Agent errors

use crds::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("State is not valid: {0}")]
    Validation(#[from] StateError),

    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Device error: {0}")]
    Device(String),
}
