//! Storage backend contract and its two implementations.
//!
//! [`s3::S3Backend`] talks to S3-compatible object storage,
//! [`firebase::FirebaseBackend`] to Firebase Storage. A backend is built per
//! operation by a [`BackendFactory`] and handed around as
//! `Arc<dyn StorageBackend>`.

pub mod firebase;
pub mod s3;
pub mod scope;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::StorageError;
use crate::selector::BackendKind;
use crate::transfer::{self, TransferProgress};

pub use firebase::FirebaseBackend;
pub use s3::S3Backend;
pub use scope::Principal;

/// An object returned by [`StorageBackend::list`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectInfo {
    /// Key relative to the backend's namespace
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: u64,
}

/// Result of deleting a single object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The object did not exist; treated as success
    Missing,
}

/// Result of a batch delete where nothing failed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub missing: Vec<String>,
}

/// Operations shared by every storage backend
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Target the client uploads to. S3 returns a time-limited PUT URL,
    /// Firebase returns the scoped object path.
    async fn presign_upload(&self, key: &str) -> Result<String, StorageError>;

    /// Transfer `data` to a target produced by [`Self::presign_upload`]
    async fn put_presigned(
        &self,
        target: &str,
        data: Bytes,
        content_type: &str,
        progress: &dyn TransferProgress,
    ) -> Result<(), StorageError>;

    /// Readable URL for previews, regenerated per call unless public
    async fn presign_preview(
        &self,
        key: &str,
        expires_in: Option<Duration>,
    ) -> Result<String, StorageError>;

    /// Direct server-side write
    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<(), StorageError>;

    async fn upload_content(&self, path: &str, content: &str) -> Result<(), StorageError> {
        self.upload(path, Bytes::from(content.to_owned()), Some("text/plain"))
            .await
    }

    /// Resolved URL for `key`
    async fn file_url(&self, key: &str) -> Result<String, StorageError>;

    async fn get_bytes(&self, key: &str) -> Result<Bytes, StorageError>;

    async fn get_content(&self, key: &str) -> Result<String, StorageError>;

    async fn delete(&self, key: &str) -> Result<DeleteOutcome, StorageError>;

    /// Attempt every deletion; failures are aggregated into
    /// [`StorageError::BatchDelete`]
    async fn delete_many(&self, keys: &[String]) -> Result<DeleteReport, StorageError>;

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<ObjectInfo>, StorageError>;

    /// Collision-resistant name keeping the original extension
    fn generate_file_name(&self, original_name: &str) -> String {
        generate_file_name(original_name)
    }

    /// Resumable upload capability, only offered by Firebase
    fn as_resumable(&self) -> Option<&dyn ResumableUpload> {
        None
    }
}

/// SDK-style resumable upload
#[async_trait]
pub trait ResumableUpload: Send + Sync {
    /// Upload `data` to `key` and return its download URL
    async fn resumable_upload(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        progress: &dyn TransferProgress,
    ) -> Result<String, StorageError>;
}

/// Extension after the last dot, if any
pub fn file_extension(name: &str) -> Option<&str> {
    name.rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && !ext.contains('/'))
}

/// `{uuid}.{ext}`, or just `{uuid}` when the name has no extension
pub fn generate_file_name(original_name: &str) -> String {
    let id = Uuid::new_v4();
    match file_extension(original_name) {
        Some(ext) => format!("{id}.{ext}"),
        None => id.to_string(),
    }
}

/// Delete keys one by one, concurrently, for backends without a batch API
pub async fn delete_individually<F, Fut>(
    keys: &[String],
    delete: F,
) -> Result<DeleteReport, StorageError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<DeleteOutcome, StorageError>>,
{
    let results = join_all(keys.iter().map(|key| {
        let pending = delete(key.clone());
        async move { (key.clone(), pending.await) }
    }))
    .await;

    let mut report = DeleteReport::default();
    let mut failures = Vec::new();
    for (key, result) in results {
        match result {
            Ok(DeleteOutcome::Deleted) => report.deleted.push(key),
            Ok(DeleteOutcome::Missing) => report.missing.push(key),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to delete object");
                failures.push((key, e));
            }
        }
    }

    if !report.missing.is_empty() {
        info!(missing = ?report.missing, "Some objects were already absent");
    }

    if failures.is_empty() {
        Ok(report)
    } else {
        Err(StorageError::BatchDelete { failures })
    }
}

/// Builds the backend for one operation
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn build(
        &self,
        kind: BackendKind,
        config: &Config,
        principal: &Principal,
    ) -> Result<Arc<dyn StorageBackend>, StorageError>;
}

/// Factory constructing the real S3 and Firebase clients
pub struct DefaultBackendFactory;

#[async_trait]
impl BackendFactory for DefaultBackendFactory {
    async fn build(
        &self,
        kind: BackendKind,
        config: &Config,
        principal: &Principal,
    ) -> Result<Arc<dyn StorageBackend>, StorageError> {
        let client = transfer::build_client(config.request_timeout())?;
        let chunk_size = config.upload.chunk_size_bytes;

        let backend: Arc<dyn StorageBackend> = match kind {
            BackendKind::ObjectStorage => {
                Arc::new(S3Backend::new(&config.s3, client, chunk_size).await?)
            }
            BackendKind::ManagedCloud => Arc::new(FirebaseBackend::new(
                &config.firebase,
                principal.clone(),
                client,
                chunk_size,
            )?),
        };
        Ok(backend)
    }
}
