//! CLI error types with exit code handling

use miette::Diagnostic;
use nyl_engine::{FailureKind, RenderFailure};
use thiserror::Error;

use crate::exit_codes;

/// CLI-specific error type that includes exit code information
#[derive(Error, Debug, Diagnostic, Clone)]
pub enum CliError {
    /// Deployment document or schema rejected
    #[error("Validation failed: {message}")]
    #[diagnostic(code(nyl::cli::validation))]
    Validation {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// One or more resources failed to render
    #[error("Render failed: {message}")]
    #[diagnostic(code(nyl::cli::render))]
    Render { message: String, code: i32 },

    /// IO error (file not found, permissions, etc.)
    #[error("IO error: {message}")]
    #[diagnostic(code(nyl::cli::io))]
    Io { message: String },

    /// Invalid arguments
    #[error("{message}")]
    #[diagnostic(code(nyl::cli::usage))]
    Usage { message: String },

    /// Internal error (runtime, unexpected failure)
    #[error("Internal error: {message}")]
    #[diagnostic(code(nyl::cli::internal))]
    Internal { message: String },
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Validation { .. } => exit_codes::VALIDATION_ERROR,
            CliError::Render { code, .. } => *code,
            CliError::Io { .. } => exit_codes::IO_ERROR,
            CliError::Usage { .. } => exit_codes::USAGE_ERROR,
            CliError::Internal { .. } => exit_codes::ERROR,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn validation_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    /// Summarize render failures; the first failure decides the exit code
    pub fn render(failures: &[RenderFailure]) -> Self {
        let code = failures
            .first()
            .map(|f| failure_exit_code(f.kind))
            .unwrap_or(exit_codes::ERROR);
        let message = if failures.len() == 1 {
            "1 failure".to_string()
        } else {
            format!("{} failures", failures.len())
        };
        Self::Render { message, code }
    }
}

fn failure_exit_code(kind: FailureKind) -> i32 {
    match kind {
        FailureKind::SchemaValidation => exit_codes::VALIDATION_ERROR,
        FailureKind::PackageLoad | FailureKind::CycleDetected => exit_codes::PACKAGE_ERROR,
        _ => exit_codes::TEMPLATE_ERROR,
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io {
            message: err.to_string(),
        }
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
