use crate::config::{Config, RuntimeKind};
use crate::error::StorageError;
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Remote storage backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// S3-compatible object storage
    ObjectStorage,
    /// Firebase Storage
    ManagedCloud,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::ObjectStorage => write!(f, "S3"),
            BackendKind::ManagedCloud => write!(f, "Firebase"),
        }
    }
}

/// Which backends are usable, derived from one configuration snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendAvailability {
    pub object_storage_configured: bool,
    pub managed_cloud_configured: bool,
    pub restricted_runtime: bool,
}

impl BackendAvailability {
    pub fn from_config(config: &Config) -> Self {
        Self {
            object_storage_configured: config.s3.is_configured(),
            managed_cloud_configured: config.firebase.is_configured(),
            restricted_runtime: config.service.runtime == RuntimeKind::Edge,
        }
    }

    /// Firebase can host a direct resumable upload in this environment
    pub fn managed_cloud_available(&self) -> bool {
        self.managed_cloud_configured && !self.restricted_runtime
    }

    /// Any remote backend could be selected
    pub fn any_remote(&self) -> bool {
        self.object_storage_configured || self.managed_cloud_available()
    }
}

impl fmt::Display for BackendAvailability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "runtime={} s3={} firebase={}",
            if self.restricted_runtime { "edge" } else { "full" },
            self.object_storage_configured,
            self.managed_cloud_configured
        )
    }
}

/// Decide which backend serves an operation.
///
/// The restricted runtime can only use object storage. Otherwise object
/// storage wins over Firebase when both are configured.
pub fn select_backend(availability: &BackendAvailability) -> Result<BackendKind, StorageError> {
    let kind = if availability.restricted_runtime {
        if !availability.object_storage_configured {
            return Err(StorageError::Configuration(
                "restricted runtime requires object storage (S3 access key, secret and bucket); \
                 Firebase is not supported there"
                    .to_string(),
            ));
        }
        BackendKind::ObjectStorage
    } else if availability.object_storage_configured {
        BackendKind::ObjectStorage
    } else if availability.managed_cloud_configured {
        BackendKind::ManagedCloud
    } else {
        return Err(StorageError::Configuration(
            "no storage backend configured".to_string(),
        ));
    };

    debug!(%availability, backend = %kind, "Selected storage backend");
    Ok(kind)
}
