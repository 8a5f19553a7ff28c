//! Error types for Fieldforge.
//!
//! Library crates use [`FieldforgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Fieldforge operations.
#[derive(Debug, thiserror::Error)]
pub enum FieldforgeError {
    /// Configuration loading or structural misconfiguration.
    #[error("config error: {message}")]
    Config { message: String },

    /// Model provider error (request rejected, malformed completion).
    #[error("provider error: {0}")]
    Provider(String),

    /// Network/HTTP error talking to an external collaborator.
    #[error("network error: {0}")]
    Network(String),

    /// A single step failed on a single record.
    #[error("step `{step}` failed: {message}")]
    Step { step: String, message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (unknown parameter, wrong type, bad grid, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Tabular export error.
    #[error("export error: {0}")]
    Export(String),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, FieldforgeError>;

impl FieldforgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a per-record step error.
    pub fn step(step: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error signals a structural misconfiguration.
    ///
    /// Fatal errors abort a run immediately; everything else raised while
    /// processing a record is recorded as a failed row and processing moves on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::Validation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = FieldforgeError::config("no client registered for model `gpt-x`");
        assert_eq!(
            err.to_string(),
            "config error: no client registered for model `gpt-x`"
        );

        let err = FieldforgeError::step("classify", "timeout");
        assert_eq!(err.to_string(), "step `classify` failed: timeout");
    }

    #[test]
    fn fatal_classification() {
        assert!(FieldforgeError::config("x").is_fatal());
        assert!(FieldforgeError::validation("x").is_fatal());
        assert!(!FieldforgeError::Provider("rate limited".into()).is_fatal());
        assert!(!FieldforgeError::step("s", "boom").is_fatal());
        assert!(!FieldforgeError::Network("reset".into()).is_fatal());
    }
}
