//! Error types for the ZFS PV provisioner
//!
//! Provides structured error types for configuration loading, reconciliation,
//! storage backends and the transports they use.

use thiserror::Error;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Watch stream error: {0}")]
    WatchStream(String),

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    #[error("No storage provider configured for storage class '{storage_class}'")]
    NoStorageClass { storage_class: String },

    #[error("Cannot clone from '{source_claim}' in namespace {namespace}: {reason}")]
    CloneSource {
        namespace: String,
        source_claim: String,
        reason: String,
    },

    #[error("Backend for storage class '{storage_class}' declined claim {namespace}/{claim}")]
    BackendDeclined {
        storage_class: String,
        namespace: String,
        claim: String,
    },

    // =========================================================================
    // Annotation Errors
    // =========================================================================
    #[error("Required annotation missing: {key}")]
    MissingAnnotation { key: String },

    #[error("Invalid value for annotation {key}: {value}")]
    InvalidAnnotation { key: String, value: String },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Remote transport error on {host}: {reason}")]
    RemoteTransport { host: String, reason: String },

    #[error("Remote command failed with exit status {status}: {command}")]
    RemoteCommand { command: String, status: i32, output: String },

    #[error("Management API connection error: {0}")]
    ManagementApi(#[from] reqwest::Error),

    #[error("Management API returned {status} for {operation}: {body}")]
    ManagementApiStatus {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    BackendOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action a controller loop takes after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Drop the event, or reopen the watch; nothing else to repair
    DropEvent,
    /// Rebuild the cluster API session before continuing
    ResetSession,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Session-level failures talking to the cluster
            Error::Kube(_) | Error::Io(_) | Error::JsonParse(_) => ErrorAction::ResetSession,

            // Scoped to a single claim, volume or watch stream
            _ => ErrorAction::DropEvent,
        }
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::WatchStream(_)
                | Error::RemoteTransport { .. }
                | Error::ManagementApi(_)
        )
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;
