//! Error types for nyl-kube

use thiserror::Error;

/// Result type for nyl-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur while talking to the API server
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// API discovery failed
    #[error("API discovery failed: {0}")]
    Discovery(String),

    /// Object could not be converted to JSON
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KubeError {
    /// Check if this error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api(kube::Error::Api(e)) if e.code == 404)
    }

    /// Forbidden reads are reported as unavailable rather than missing
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Api(kube::Error::Api(e)) if e.code == 403)
    }
}
