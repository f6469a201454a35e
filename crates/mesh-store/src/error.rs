//! Object store errors

use thiserror::Error;

/// Errors returned by [`crate::ObjectStore`] implementations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write rejected because the object changed since it was read
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Call did not finish before the store deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Any other Kubernetes API failure
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Object is missing a field the store needs (name, namespace)
    #[error("Invalid object: {0}")]
    InvalidObject(String),
}

impl StoreError {
    /// Map a kube error, turning 404 and 409 into their own variants
    #[must_use]
    pub fn from_kube(err: kube::Error, what: &str) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(what.to_string()),
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(what.to_string()),
            other => StoreError::Kube(other),
        }
    }

    /// True for [`StoreError::NotFound`]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// True for [`StoreError::Conflict`]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Turns a not-found error into `Ok(None)`
pub trait StoreResultExt<T> {
    /// `Ok(Some(v))` on success, `Ok(None)` on not-found, the error otherwise
    ///
    /// # Errors
    ///
    /// Propagates every error other than [`StoreError::NotFound`].
    fn found(self) -> Result<Option<T>, StoreError>;
}

impl<T> StoreResultExt<T> for Result<T, StoreError> {
    fn found(self) -> Result<Option<T>, StoreError> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
