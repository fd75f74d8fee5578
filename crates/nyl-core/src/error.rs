//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Package not found: {path}")]
    PackageNotFound { path: String },

    #[error("Invalid package: {message}")]
    InvalidPackage { message: String },

    #[error("Invalid schema: {message}")]
    InvalidSchema { message: String },

    #[error("Invalid resource {resource}: {message}")]
    InvalidResource { resource: String, message: String },

    #[error("Invalid deployment configuration: {message}")]
    InvalidDeployment { message: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Values merge error: {message}")]
    ValuesMerge { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

impl CoreError {
    pub fn invalid_resource(resource: impl ToString, message: impl Into<String>) -> Self {
        Self::InvalidResource {
            resource: resource.to_string(),
            message: message.into(),
        }
    }
}

/// A single schema violation, pointing at the offending field
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationErrorInfo {
    /// JSON pointer of the offending field (`/image/tag`), or `(root)`
    pub path: String,

    /// Human-readable message
    pub message: String,
}

impl std::fmt::Display for ValidationErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
