//! Controller-specific error types.
//!
//! This module defines error types specific to the platform controller
//! that are not covered by upstream library errors.

use thiserror::Error;

/// Errors that can occur in the platform controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The resource version changed between the start of a reconcile pass
    /// and an action execution
    #[error("resource {0} changed during reconcile pass")]
    StaleResource(String),

    /// Optimistic-concurrency update failed after local retries
    #[error("conflict updating {0} after retries")]
    Conflict(String),

    /// Manifest rendering failed
    #[error("manifest rendering failed: {0}")]
    Render(String),

    /// Backup or restore failed
    #[error("backup error: {0}")]
    Backup(String),

    /// An upgrade pipeline step failed
    #[error("upgrade step {step} failed: {message}")]
    Step {
        /// Name of the failing step
        step: String,
        /// Failure detail
        message: String,
    },

    /// Rollback requested while the attempt log does not end in a failure
    #[error("rollback not allowed: {0}")]
    RollbackNotAllowed(String),

    /// A phase combination that the upgrade machinery does not support;
    /// indicates a programming error, never silently ignored
    #[error("unsupported phase {0} during upgrade execution")]
    UnsupportedPhase(String),

    /// A bounded poll ran past its hard timeout
    #[error("timed out waiting for {0}")]
    PollTimeout(String),

    /// Pod lookup or command execution inside a pod failed
    #[error("pod exec failed: {0}")]
    Exec(String),

    /// The database version could not be determined
    #[error("unable to determine database version: {0}")]
    DatabaseVersion(String),

    /// Local filesystem error (backup artifacts, version marker)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// True when the underlying Kubernetes error is a 404.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ControllerError::Kube(kube::Error::Api(e)) if e.code == 404
        )
    }

    /// True when the underlying Kubernetes error is a 409 write conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ControllerError::Kube(kube::Error::Api(e)) if e.code == 409
        )
    }
}

/// True when a raw kube error is a 404.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}
