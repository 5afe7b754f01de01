//! Error types for storage backends and the upload pipeline.

use thiserror::Error;

/// Errors raised by storage backends and the backend selector
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// No usable backend for the current environment. Fatal, never retried.
    #[error("Storage configuration error: {0}")]
    Configuration(String),

    /// Backend constructed without valid credentials
    #[error("{backend} storage is not initialized")]
    NotInitialized { backend: &'static str },

    #[error("Object not found: {key}")]
    NotFound { key: String },

    /// Transport failed before any HTTP status was received
    #[error("Network error: {message}")]
    Network { message: String },

    /// Authentication or ownership mismatch
    #[error("Permission denied for {key}: {message}")]
    Permission { key: String, message: String },

    /// Remote answered with a non-success status
    #[error("Remote rejected request for {key} with status {status}: {message}")]
    RemoteRejection {
        key: String,
        status: u16,
        message: String,
    },

    #[error("Invalid storage key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// One or more deletions in a batch failed
    #[error("Failed to delete {} object(s)", failures.len())]
    BatchDelete { failures: Vec<(String, StorageError)> },
}

impl StorageError {
    /// Only transport failures are safe to retry as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Network { .. })
    }

    pub fn network(message: impl Into<String>) -> Self {
        StorageError::Network {
            message: message.into(),
        }
    }

    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        StorageError::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the upload coordinator
#[derive(Error, Debug)]
pub enum UploadError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Non-image content outside full deployment mode with no remote backend
    #[error("File type {extension:?} is only supported in full deployment mode")]
    UnsupportedFileType { extension: String },

    #[error("Invalid data URI: {0}")]
    InvalidDataUri(String),

    /// The external file-record service failed
    #[error("File record service error: {0}")]
    Records(String),

    #[error("Failed to load configuration: {0}")]
    Config(String),
}

impl UploadError {
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Message suitable for showing to the person who started the upload
    pub fn user_message(&self) -> String {
        match self {
            UploadError::Storage(StorageError::Configuration(msg)) if msg.contains("restricted") => {
                "Upload failed: the restricted runtime requires object storage to be configured. \
                 Please ask an administrator to configure S3."
                    .to_string()
            }
            UploadError::Storage(StorageError::Configuration(_)) | UploadError::Config(_) => {
                "Upload failed: no storage backend is configured.".to_string()
            }
            UploadError::Storage(StorageError::Permission { .. }) => {
                "Upload failed: you are not allowed to write to this location. Please sign in again."
                    .to_string()
            }
            UploadError::UnsupportedFileType { extension } => format!(
                "Files of type .{extension} can only be uploaded when the server storage is enabled."
            ),
            UploadError::InvalidDataUri(_) => "Upload failed: the image data is invalid.".to_string(),
            _ => "Upload failed, please try again later.".to_string(),
        }
    }
}
