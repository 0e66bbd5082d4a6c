//! Error types for Modelyard Core.
//!
//! Every fallible operation in this crate returns [`ModelyardError`]. Variants
//! carry the failing path where one exists; [`ModelyardError::kind`] maps each
//! variant onto the coarse taxonomy used by callers to decide whether a
//! failure is retryable, user-correctable, or a bug.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Modelyard operations.
#[derive(Debug, Error)]
pub enum ModelyardError {
    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("Filesystem is read-only: {0}")]
    ReadOnlyFilesystem(PathBuf),

    #[error("Symlinks are not supported at {dir}: {reason}")]
    SymlinksUnsupported { dir: PathBuf, reason: String },

    #[error("Failed to create {strategy} link from {src} to {target}: {reason}")]
    LinkFailed {
        strategy: String,
        src: PathBuf,
        target: PathBuf,
        reason: String,
    },

    #[error("Link target already exists: {0}")]
    LinkTargetExists(PathBuf),

    #[error("A link for target {0} is already registered")]
    DuplicateLinkTarget(PathBuf),

    #[error("Refusing to remove real file through link removal: {0}")]
    RefusedRealFile(PathBuf),

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Corrupt metadata at {path}: {message}")]
    CorruptMetadata { path: PathBuf, message: String },

    // Model library errors
    #[error("Model not found: {model_id}")]
    ModelNotFound { model_id: String },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    // Mapper errors
    #[error("No mapping config found for {app_id} {version:?}")]
    ConfigNotFound {
        app_id: String,
        version: Option<String>,
    },

    #[error("Invalid mapping config {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Modelyard operations.
pub type Result<T> = std::result::Result<T, ModelyardError>;

/// Coarse failure classification.
///
/// This is the contract mid-level components use when deciding whether to
/// skip a record, surface the failure, or abort: conflicts and not-found are
/// caller-correctable, corrupt records are skip-and-log, resource denials are
/// environmental, unsupported means the platform cannot do it at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Something already occupies the place we wanted to write.
    Conflict,
    /// The named model, config, or link does not exist.
    NotFound,
    /// Stored data failed to parse.
    Corrupt,
    /// Permissions, read-only mounts, disk-full.
    ResourceDenied,
    /// The platform/filesystem cannot perform the operation.
    Unsupported,
    /// Everything else.
    Internal,
}

// Conversion implementations for common error types

impl From<std::io::Error> for ModelyardError {
    fn from(err: std::io::Error) -> Self {
        ModelyardError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ModelyardError {
    fn from(err: serde_json::Error) -> Self {
        ModelyardError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for ModelyardError {
    fn from(err: rusqlite::Error) -> Self {
        ModelyardError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ModelyardError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ModelyardError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Classify this error into the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModelyardError::LinkTargetExists(_)
            | ModelyardError::DuplicateLinkTarget(_)
            | ModelyardError::RefusedRealFile(_) => ErrorKind::Conflict,

            ModelyardError::FileNotFound(_)
            | ModelyardError::ModelNotFound { .. }
            | ModelyardError::ConfigNotFound { .. } => ErrorKind::NotFound,

            ModelyardError::CorruptMetadata { .. }
            | ModelyardError::Json { .. }
            | ModelyardError::ConfigInvalid { .. } => ErrorKind::Corrupt,

            ModelyardError::PermissionDenied(_) | ModelyardError::ReadOnlyFilesystem(_) => {
                ErrorKind::ResourceDenied
            }

            ModelyardError::SymlinksUnsupported { .. } => ErrorKind::Unsupported,

            ModelyardError::Io { source, .. } => match source {
                Some(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                Some(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    ErrorKind::ResourceDenied
                }
                _ => ErrorKind::Internal,
            },

            _ => ErrorKind::Internal,
        }
    }
}
