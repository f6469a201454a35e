//! State file loading

use crate::error::AgentError;
use crds::State;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Hex encoded SHA-256 of the raw file content
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Read and parse the state file.
///
/// Returns the parsed state with the hash of the bytes it was parsed from.
/// The state is not validated.
///
/// # Errors
///
/// Returns an error when the file cannot be read or is not a state document.
pub async fn load_state(path: &Path) -> Result<(State, String), AgentError> {
    let bytes = tokio::fs::read(path).await?;
    let hash = content_hash(&bytes);
    let state = serde_json::from_slice(&bytes)?;
    Ok((state, hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{state_json, valid_state};

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(content_hash(b"a"), content_hash(b"b"));
    }

    #[tokio::test]
    async fn test_load_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let json = state_json(&valid_state());
        std::fs::write(&path, &json).unwrap();

        let (state, hash) = load_state(&path).await.unwrap();
        assert_eq!(hash, content_hash(json.as_bytes()));
        assert_eq!(state.server_address(), "203.0.113.7");
        assert_eq!(state.peers.len(), 2);
    }

    #[tokio::test]
    async fn test_load_state_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert!(matches!(load_state(&path).await, Err(AgentError::Io(_))));

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_state(&path).await, Err(AgentError::Json(_))));
    }
}
