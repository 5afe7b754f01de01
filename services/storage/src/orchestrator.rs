//! Upload strategies.
//!
//! Two ways to move bytes to a backend:
//! - direct-resumable: a chunked session straight to Firebase, progress
//!   reported after every chunk
//! - presign-then-PUT: ask the backend for a target, then transfer to it,
//!   holding a finished transfer at 99.9% until the remote confirms
//!
//! Both end in `Processing` at 100% and return the [`FileMetadata`] the
//! coordinator registers. Failures are returned without touching the
//! tracker so the caller can fall back to another strategy.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::backend::firebase::dated_key;
use crate::backend::s3::partitioned_key;
use crate::backend::StorageBackend;
use crate::error::StorageError;
use crate::progress::{RateTracker, UploadState, UploadStatus, UploadTracker};
use crate::records::FileMetadata;
use crate::selector::BackendKind;
use crate::transfer::TransferProgress;

/// What to transfer, with the digest computed once by the caller
#[derive(Debug, Clone)]
pub struct TransferRequest<'a> {
    pub hash: &'a str,
    pub original_filename: &'a str,
    pub mime_type: &'a str,
    pub directory: Option<&'a str>,
    pub data: Bytes,
}

/// Whole hours since the Unix epoch
pub fn hour_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(3600)
}

/// Feeds transport byte counts into the tracker as `Uploading` updates
struct TrackerProgress<'a, 'b> {
    tracker: &'a UploadTracker<'b>,
    rate: RateTracker,
    cap_at_complete: bool,
}

impl<'a, 'b> TrackerProgress<'a, 'b> {
    fn new(tracker: &'a UploadTracker<'b>, total: u64, cap_at_complete: bool) -> Self {
        Self {
            tracker,
            rate: RateTracker::new(total),
            cap_at_complete,
        }
    }

    fn start(&self) {
        self.tracker
            .transition(UploadStatus::Uploading, self.rate.state(0, self.cap_at_complete));
    }

    fn finish(&self) {
        self.tracker.transition(
            UploadStatus::Processing,
            UploadState::complete(self.rate.average_speed()),
        );
    }
}

impl TransferProgress for TrackerProgress<'_, '_> {
    fn on_transfer(&self, transferred: u64, _total: u64) {
        self.tracker.transition(
            UploadStatus::Uploading,
            self.rate.state(transferred, self.cap_at_complete),
        );
    }
}

fn split_key(key: &str) -> (&str, &str) {
    key.rsplit_once('/').unwrap_or(("", key))
}

fn build_metadata(
    request: &TransferRequest<'_>,
    key: &str,
    storage_path: String,
    at: DateTime<Utc>,
) -> FileMetadata {
    let (dirname, filename) = split_key(key);
    FileMetadata {
        content_hash: request.hash.to_string(),
        storage_path,
        dirname: dirname.to_string(),
        filename: filename.to_string(),
        original_filename: request.original_filename.to_string(),
        mime_type: request.mime_type.to_string(),
        size_bytes: request.data.len() as u64,
        created_at_bucket: hour_bucket(at),
    }
}

/// Resumable upload straight to a backend that supports it.
///
/// The key is date partitioned under the backend's principal scope and the
/// stored path is the returned download URL.
#[instrument(skip_all, fields(backend = %backend.kind(), size_bytes = request.data.len()))]
pub async fn direct_resumable(
    backend: &dyn StorageBackend,
    request: &TransferRequest<'_>,
    tracker: &UploadTracker<'_>,
) -> Result<FileMetadata, StorageError> {
    let resumable = backend.as_resumable().ok_or_else(|| {
        StorageError::Configuration(format!(
            "{} backend does not support resumable uploads",
            backend.kind()
        ))
    })?;

    let now = Utc::now();
    let file_name = backend.generate_file_name(request.original_filename);
    let key = dated_key(request.directory, now, &file_name);

    let progress = TrackerProgress::new(tracker, request.data.len() as u64, false);
    progress.start();

    let download_url = resumable
        .resumable_upload(&key, request.data.clone(), request.mime_type, &progress)
        .await?;

    progress.finish();
    info!(key = %key, "Direct resumable upload completed");

    Ok(build_metadata(request, &key, download_url, now))
}

/// Presign a target on `backend`, then transfer to it.
///
/// Object storage keys are `{directory}/{hour_bucket}/{file}` and are stored
/// as-is. Firebase keys are date partitioned and stored as download URLs.
#[instrument(skip_all, fields(backend = %backend.kind(), size_bytes = request.data.len()))]
pub async fn presign_then_put(
    backend: &dyn StorageBackend,
    request: &TransferRequest<'_>,
    default_directory: &str,
    tracker: &UploadTracker<'_>,
) -> Result<FileMetadata, StorageError> {
    let now = Utc::now();
    let file_name = backend.generate_file_name(request.original_filename);
    let key = match backend.kind() {
        BackendKind::ObjectStorage => partitioned_key(
            request.directory.unwrap_or(default_directory),
            hour_bucket(now),
            &file_name,
        ),
        BackendKind::ManagedCloud => dated_key(request.directory, now, &file_name),
    };

    let target = backend.presign_upload(&key).await?;
    debug!(key = %key, "Presigned upload target");

    let progress = TrackerProgress::new(tracker, request.data.len() as u64, true);
    progress.start();

    backend
        .put_presigned(&target, request.data.clone(), request.mime_type, &progress)
        .await?;

    let storage_path = match backend.kind() {
        BackendKind::ObjectStorage => key.clone(),
        BackendKind::ManagedCloud => backend.file_url(&key).await?,
    };

    progress.finish();
    info!(key = %key, "Presigned upload completed");

    Ok(build_metadata(request, &key, storage_path, now))
}
