// src/error.rs

use thiserror::Error;

/// Core error types for Stowage
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// The supplied bytes are not a readable module archive
    #[error("Invalid module archive: {0}")]
    InvalidArchive(String),

    /// A version string could not be normalized
    #[error("Invalid version '{0}'")]
    InvalidVersion(String),

    /// No source yielded a usable symbolic name or version
    #[error("Missing module {0} in descriptor, manifest or supplied metadata")]
    MissingIdentity(String),

    /// Two sources disagree about the module identity
    #[error("Module {field} mismatch '{found}' from {source_name} (expected '{expected}')")]
    IdentityMismatch {
        field: &'static str,
        found: String,
        source_name: String,
        expected: String,
    },

    /// No bytes could be obtained for the requested module
    #[error("Unable to resolve module source: {0}")]
    UnresolvableSource(String),

    /// Download failures
    #[error("Download error: {0}")]
    DownloadError(String),

    /// A different module with the same non-snapshot identity is installed
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A declared item collides with an item owned by another module
    #[error("Declared item conflict: {0}")]
    ItemConflict(String),

    /// A declared item failed validation
    #[error("Invalid declared item: {0}")]
    InvalidItem(String),

    /// The module registry rejected an operation
    #[error("Registry error: {0}")]
    Registry(String),

    /// Starting a module or loading its items failed
    #[error("Activation error: {0}")]
    Activation(String),

    /// The installer's own bookkeeping is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rollback after a failed activation also failed
    #[error(
        "Failure installing and rolling back {artifact}; state may be inconsistent. \
         Rollback failure: {rollback}. Installation error: {original}"
    )]
    RollbackFailed {
        artifact: String,
        original: Box<Error>,
        rollback: Box<Error>,
    },

    /// Installer instance used incorrectly
    #[error("Usage error: {0}")]
    Usage(String),
}

impl Error {
    /// True for errors caused by the caller's input rather than by the
    /// registry or the installer's own state.
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            Error::InvalidArchive(_)
                | Error::InvalidVersion(_)
                | Error::MissingIdentity(_)
                | Error::IdentityMismatch { .. }
                | Error::UnresolvableSource(_)
        )
    }

    /// True when the system must be assumed inconsistent
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::RollbackFailed { .. } | Error::Config(_))
    }
}

/// Result type alias using Stowage's Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_mismatch_names_both_values() {
        let err = Error::IdentityMismatch {
            field: "symbolic name",
            found: "other".to_string(),
            source_name: "MANIFEST.MF in archive".to_string(),
            expected: "acme.core".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("other"));
        assert!(msg.contains("acme.core"));
        assert!(msg.contains("MANIFEST.MF"));
        assert!(err.is_input());
    }

    #[test]
    fn test_rollback_failure_reports_both_errors() {
        let err = Error::RollbackFailed {
            artifact: "acme.core:1.0.0".to_string(),
            original: Box::new(Error::Activation("start failed".to_string())),
            rollback: Box::new(Error::Registry("update refused".to_string())),
        };
        let msg = err.to_string();
        assert!(msg.contains("start failed"));
        assert!(msg.contains("update refused"));
        assert!(err.is_fatal());
        assert!(!err.is_input());
    }
}
