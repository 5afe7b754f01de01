//! Upload coordination.
//!
//! For every upload the coordinator hashes the bytes once, short-circuits
//! on a known hash, snapshots backend availability, walks the fallback
//! chain (direct-resumable, then presign-then-PUT, or the local mirror when
//! nothing remote is configured), mirrors the bytes and registers the file
//! record.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{Local, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, instrument, warn};

use crate::backend::{file_extension, BackendFactory, Principal};
use crate::config::{Config, DeploymentMode};
use crate::error::{StorageError, UploadError};
use crate::hasher::hash_bytes;
use crate::mirror::{mirror_storage_path, MirrorStore, MIRROR_SCHEME};
use crate::orchestrator::{self, hour_bucket, TransferRequest};
use crate::progress::{
    event_stream, ProgressObserver, UploadEvent, UploadState, UploadStatus, UploadTracker,
};
use crate::records::{FileMetadata, FileRecord, FileRecordService, NewFileRecord};
use crate::selector::{select_backend, BackendAvailability, BackendKind};
use crate::transfer;

/// Source of the configuration snapshot taken at the start of each upload
pub trait EnvironmentSource: Send + Sync {
    fn snapshot(&self) -> Result<Config, UploadError>;
}

/// Re-reads files and environment variables for every upload
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigEnvironment;

impl EnvironmentSource for ConfigEnvironment {
    fn snapshot(&self) -> Result<Config, UploadError> {
        Config::load().map_err(|e| UploadError::Config(format!("{e:#}")))
    }
}

/// Fixed configuration
#[derive(Debug, Clone)]
pub struct StaticEnvironment(pub Config);

impl EnvironmentSource for StaticEnvironment {
    fn snapshot(&self) -> Result<Config, UploadError> {
        Ok(self.0.clone())
    }
}

/// One file to upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Bytes,
    pub directory: Option<String>,
    pub knowledge_base_id: Option<String>,
    /// Allow non-image files into the local mirror outside full deployments
    pub skip_file_type_check: bool,
}

impl UploadRequest {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, bytes: Bytes) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            bytes,
            directory: None,
            knowledge_base_id: None,
            skip_file_type_check: false,
        }
    }

    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_knowledge_base(mut self, id: impl Into<String>) -> Self {
        self.knowledge_base_id = Some(id.into());
        self
    }

    pub fn skip_file_type_check(mut self) -> Self {
        self.skip_file_type_check = true;
        self
    }

    fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Result of [`UploadCoordinator::upload_data_uri`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataUriUpload {
    pub file_type: String,
    pub hash: String,
    pub metadata: FileMetadata,
    pub size: u64,
    pub record: FileRecord,
}

/// Runs uploads against the configured backends
#[derive(Clone)]
pub struct UploadCoordinator {
    env: Arc<dyn EnvironmentSource>,
    factory: Arc<dyn BackendFactory>,
    records: Arc<dyn FileRecordService>,
    mirror: Arc<dyn MirrorStore>,
    retry_initial_interval: Duration,
    retry_budget: Duration,
}

impl UploadCoordinator {
    pub fn new(
        env: Arc<dyn EnvironmentSource>,
        factory: Arc<dyn BackendFactory>,
        records: Arc<dyn FileRecordService>,
        mirror: Arc<dyn MirrorStore>,
    ) -> Self {
        Self {
            env,
            factory,
            records,
            mirror,
            retry_initial_interval: Duration::from_millis(500),
            retry_budget: Duration::from_secs(30),
        }
    }

    /// Backoff settings for [`Self::upload_with_retry`]
    pub fn with_retry(mut self, initial_interval: Duration, budget: Duration) -> Self {
        self.retry_initial_interval = initial_interval;
        self.retry_budget = budget;
        self
    }

    /// Upload one file, reporting progress to `observer`
    pub async fn upload(
        &self,
        request: &UploadRequest,
        principal: &Principal,
        observer: &dyn ProgressObserver,
    ) -> Result<FileRecord, UploadError> {
        let tracker = UploadTracker::new(observer);
        let outcome = self.attempt(request, principal, &tracker).await;
        if outcome.is_err() {
            tracker.fail();
        }
        outcome
    }

    /// [`Self::upload`], retrying the whole flow while failures are
    /// transport errors. All attempts report to one tracker, which only
    /// enters `Error` once retrying stops.
    pub async fn upload_with_retry(
        &self,
        request: &UploadRequest,
        principal: &Principal,
        observer: &dyn ProgressObserver,
    ) -> Result<FileRecord, UploadError> {
        let tracker = UploadTracker::new(observer);
        let mut backoff = ExponentialBackoff {
            initial_interval: self.retry_initial_interval,
            max_elapsed_time: Some(self.retry_budget),
            ..Default::default()
        };

        let mut attempts = 0u32;
        let error = loop {
            match self.attempt(request, principal, &tracker).await {
                Ok(record) => return Ok(record),
                Err(e) if e.is_retryable() => {
                    attempts += 1;
                    match backoff.next_backoff() {
                        Some(delay) => {
                            warn!(
                                attempt = attempts,
                                delay_ms = delay.as_millis(),
                                error = %e,
                                "Upload failed, retrying"
                            );
                            metrics::counter!("storage.uploads.retried").increment(1);
                            tokio::time::sleep(delay).await;
                        }
                        None => break e,
                    }
                }
                Err(e) => break e,
            }
        };

        tracker.fail();
        Err(error)
    }

    /// Upload an image given as `data:{mime};base64,{payload}`
    pub async fn upload_data_uri(
        &self,
        data_uri: &str,
        filename: Option<&str>,
        principal: &Principal,
        observer: &dyn ProgressObserver,
    ) -> Result<DataUriUpload, UploadError> {
        let (mime_type, bytes) = parse_data_uri(data_uri)?;
        let name = data_uri_file_name(filename, &mime_type);
        let request = UploadRequest::new(name, mime_type, bytes);

        let record = self.upload(&request, principal, observer).await?;
        Ok(DataUriUpload {
            file_type: request.mime_type,
            hash: record.hash.clone(),
            metadata: record.metadata.clone(),
            size: record.size,
            record,
        })
    }

    /// Read stored content back by its recorded location.
    ///
    /// `location` is a record's `url`: a `mirror://` path, a download URL or
    /// a key on the selected backend. When the remote read fails and `hash`
    /// is known, the local mirror answers instead.
    #[instrument(skip(self, principal), fields(uid = ?principal.uid))]
    pub async fn read_content(
        &self,
        location: &str,
        hash: Option<&str>,
        principal: &Principal,
    ) -> Result<Bytes, UploadError> {
        if let Some(mirrored) = location.strip_prefix(MIRROR_SCHEME) {
            return self.read_mirror(mirrored).await;
        }

        let remote = match self.read_remote(location, principal).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) => e,
        };
        let Some(hash) = hash else {
            return Err(remote);
        };

        match self.mirror.get(hash).await {
            Ok(Some(bytes)) => {
                metrics::counter!("storage.mirror.hits").increment(1);
                warn!(location, error = %remote, "Remote read failed, served from local mirror");
                Ok(bytes)
            }
            Ok(None) => Err(remote),
            Err(e) => {
                debug!(hash, error = %e, "Mirror lookup failed");
                Err(remote)
            }
        }
    }

    async fn read_mirror(&self, hash: &str) -> Result<Bytes, UploadError> {
        self.mirror
            .get(hash)
            .await?
            .ok_or_else(|| {
                UploadError::Storage(StorageError::NotFound {
                    key: mirror_storage_path(hash),
                })
            })
    }

    async fn read_remote(&self, location: &str, principal: &Principal) -> Result<Bytes, UploadError> {
        let config = self.env.snapshot()?;
        if location.starts_with("https://") || location.starts_with("http://") {
            let client = transfer::build_client(config.request_timeout())?;
            return Ok(transfer::fetch_bytes(&client, location, location).await?);
        }

        let kind = select_backend(&BackendAvailability::from_config(&config))?;
        let backend = self.factory.build(kind, &config, principal).await?;
        Ok(backend.get_bytes(location).await?)
    }

    /// Run an upload in the background and stream its events. The stream
    /// ends after a `Completed` or `Failed` event.
    pub fn events(
        &self,
        request: UploadRequest,
        principal: Principal,
    ) -> UnboundedReceiverStream<UploadEvent> {
        let (observer, stream) = event_stream();
        let coordinator = self.clone();

        tokio::spawn(async move {
            let outcome = coordinator
                .upload(&request, &principal, &observer)
                .await
                .map_err(|e| e.user_message());
            observer.finish(outcome);
        });

        stream
    }

    #[instrument(
        skip(self, request, principal, tracker),
        fields(filename = %request.filename, size_bytes = request.bytes.len(), uid = ?principal.uid)
    )]
    async fn attempt(
        &self,
        request: &UploadRequest,
        principal: &Principal,
        tracker: &UploadTracker<'_>,
    ) -> Result<FileRecord, UploadError> {
        let started = Instant::now();
        metrics::counter!("storage.uploads.started").increment(1);

        match self.run(request, principal, tracker).await {
            Ok(record) => {
                metrics::counter!("storage.uploads.succeeded").increment(1);
                metrics::histogram!("storage.uploads.duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                info!(id = %record.id, url = %record.url, "Upload completed");
                Ok(record)
            }
            Err(e) => {
                metrics::counter!("storage.uploads.failed").increment(1);
                warn!(error = %e, "Upload failed");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: &UploadRequest,
        principal: &Principal,
        tracker: &UploadTracker<'_>,
    ) -> Result<FileRecord, UploadError> {
        let hash = hash_bytes(&request.bytes);

        let check = self
            .records
            .check_file_hash(&hash)
            .await
            .map_err(|e| UploadError::Records(format!("{e:#}")))?;
        if let (true, Some(metadata)) = (check.is_exist, check.metadata) {
            debug!(hash = %hash, storage_path = %metadata.storage_path, "Content already stored");
            metrics::counter!("storage.dedup.hits").increment(1);
            tracker.transition(UploadStatus::Processing, UploadState::complete(0.0));
            return self.register(request, &hash, metadata, tracker).await;
        }

        let config = self.env.snapshot()?;
        let availability = BackendAvailability::from_config(&config);
        let transfer = TransferRequest {
            hash: &hash,
            original_filename: &request.filename,
            mime_type: &request.mime_type,
            directory: request.directory.as_deref(),
            data: request.bytes.clone(),
        };

        let metadata = if !availability.restricted_runtime && !availability.any_remote() {
            self.store_in_mirror(request, &config, &hash, tracker).await?
        } else {
            let metadata = if availability.restricted_runtime {
                let kind = select_backend(&availability)?;
                self.presign_then_put(kind, &config, principal, &transfer, tracker)
                    .await?
            } else {
                self.remote_upload(&availability, &config, principal, &transfer, tracker)
                    .await?
            };
            if config.mirror.enabled {
                self.write_through(&hash, &request.bytes).await;
            }
            metadata
        };

        metrics::counter!("storage.bytes.uploaded").increment(request.bytes.len() as u64);
        self.register(request, &hash, metadata, tracker).await
    }

    /// Direct-resumable first when Firebase is usable, then presign-then-PUT
    /// on the selected backend
    async fn remote_upload(
        &self,
        availability: &BackendAvailability,
        config: &Config,
        principal: &Principal,
        transfer: &TransferRequest<'_>,
        tracker: &UploadTracker<'_>,
    ) -> Result<FileMetadata, StorageError> {
        if availability.managed_cloud_available() {
            match self.direct_resumable(config, principal, transfer, tracker).await {
                Ok(metadata) => return Ok(metadata),
                Err(e) => warn!(error = %e, "Direct upload failed, falling back to presigned upload"),
            }
        }

        let kind = select_backend(availability)?;
        self.presign_then_put(kind, config, principal, transfer, tracker)
            .await
    }

    async fn direct_resumable(
        &self,
        config: &Config,
        principal: &Principal,
        transfer: &TransferRequest<'_>,
        tracker: &UploadTracker<'_>,
    ) -> Result<FileMetadata, StorageError> {
        let backend = self
            .factory
            .build(BackendKind::ManagedCloud, config, principal)
            .await?;
        orchestrator::direct_resumable(backend.as_ref(), transfer, tracker).await
    }

    async fn presign_then_put(
        &self,
        kind: BackendKind,
        config: &Config,
        principal: &Principal,
        transfer: &TransferRequest<'_>,
        tracker: &UploadTracker<'_>,
    ) -> Result<FileMetadata, StorageError> {
        let backend = self.factory.build(kind, config, principal).await?;
        orchestrator::presign_then_put(backend.as_ref(), transfer, &config.upload.file_path, tracker)
            .await
    }

    /// Keep the bytes locally when no remote backend is configured
    async fn store_in_mirror(
        &self,
        request: &UploadRequest,
        config: &Config,
        hash: &str,
        tracker: &UploadTracker<'_>,
    ) -> Result<FileMetadata, UploadError> {
        let allowed = request.is_image()
            || request.skip_file_type_check
            || config.service.deployment_mode == DeploymentMode::Full;
        if !allowed {
            return Err(UploadError::UnsupportedFileType {
                extension: file_extension(&request.filename)
                    .unwrap_or_default()
                    .to_string(),
            });
        }

        tracker.transition(UploadStatus::Uploading, UploadState::default());
        self.mirror.put(hash, &request.bytes).await?;
        tracker.transition(UploadStatus::Processing, UploadState::complete(0.0));
        info!(hash = %hash, "Stored upload in local mirror");

        Ok(FileMetadata {
            content_hash: hash.to_string(),
            storage_path: mirror_storage_path(hash),
            dirname: hash[..2].to_string(),
            filename: hash.to_string(),
            original_filename: request.filename.clone(),
            mime_type: request.mime_type.clone(),
            size_bytes: request.bytes.len() as u64,
            created_at_bucket: hour_bucket(Utc::now()),
        })
    }

    async fn write_through(&self, hash: &str, bytes: &Bytes) {
        if let Err(e) = self.mirror.put(hash, bytes).await {
            metrics::counter!("storage.mirror.write_failures").increment(1);
            warn!(hash = %hash, error = %e, "Failed to mirror uploaded content");
        }
    }

    async fn register(
        &self,
        request: &UploadRequest,
        hash: &str,
        metadata: FileMetadata,
        tracker: &UploadTracker<'_>,
    ) -> Result<FileRecord, UploadError> {
        let record = NewFileRecord {
            file_type: request.mime_type.clone(),
            hash: hash.to_string(),
            name: request.filename.clone(),
            size: request.bytes.len() as u64,
            url: metadata.storage_path.clone(),
            metadata,
            knowledge_base_id: request.knowledge_base_id.clone(),
        };

        let created = self
            .records
            .create_file(record)
            .await
            .map_err(|e| UploadError::Records(format!("{e:#}")))?;

        tracker.transition(UploadStatus::Success, UploadState::complete(0.0));
        Ok(created)
    }
}

/// Split a base64 data URI into its MIME type and decoded bytes
pub fn parse_data_uri(data_uri: &str) -> Result<(String, Bytes), UploadError> {
    let rest = data_uri
        .strip_prefix("data:")
        .ok_or_else(|| UploadError::InvalidDataUri("missing data: prefix".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| UploadError::InvalidDataUri("missing payload".to_string()))?;

    let mut parts = header.split(';');
    let mime_type = parts.next().unwrap_or_default().trim();
    if mime_type.is_empty() {
        return Err(UploadError::InvalidDataUri("missing MIME type".to_string()));
    }
    if !parts.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return Err(UploadError::InvalidDataUri("payload is not base64".to_string()));
    }

    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| UploadError::InvalidDataUri(e.to_string()))?;
    Ok((mime_type.to_string(), Bytes::from(bytes)))
}

/// `{filename | image_YYYY-MM-DD-hh-mm-ss}.{subtype | png}`
pub fn data_uri_file_name(filename: Option<&str>, mime_type: &str) -> String {
    let stem = match filename.filter(|f| !f.is_empty()) {
        Some(name) => name.to_string(),
        None => format!("image_{}", Local::now().format("%Y-%m-%d-%I-%M-%S")),
    };
    let extension = mime_type
        .split_once('/')
        .map(|(_, subtype)| subtype)
        .filter(|subtype| !subtype.is_empty())
        .unwrap_or("png");
    format!("{stem}.{extension}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeKind;
    use crate::progress::FnObserver;
    use crate::records::{HashCheck, MemoryFileRecords, MockFileRecordService};
    use crate::testing::{FakeBackend, FakeFactory, FakeMirror};
    use futures::StreamExt;
    use std::sync::Mutex;

    fn s3_config(config: &mut Config) {
        config.s3.access_key_id = Some("AKIA".into());
        config.s3.secret_access_key = Some("secret".into());
        config.s3.bucket = Some("uploads".into());
    }

    fn firebase_config(config: &mut Config) {
        config.firebase.api_key = Some("key".into());
        config.firebase.project_id = Some("demo".into());
        config.firebase.storage_bucket = Some("demo.appspot.com".into());
    }

    struct Harness {
        coordinator: UploadCoordinator,
        factory: Arc<FakeFactory>,
        records: Arc<MemoryFileRecords>,
        mirror: Arc<FakeMirror>,
    }

    fn harness_with(config: Config, factory: FakeFactory, mirror: FakeMirror) -> Harness {
        let factory = Arc::new(factory);
        let records = Arc::new(MemoryFileRecords::new());
        let mirror = Arc::new(mirror);
        let coordinator = UploadCoordinator::new(
            Arc::new(StaticEnvironment(config)),
            factory.clone(),
            records.clone(),
            mirror.clone(),
        )
        .with_retry(Duration::from_millis(1), Duration::from_millis(200));
        Harness {
            coordinator,
            factory,
            records,
            mirror,
        }
    }

    fn harness(config: Config) -> Harness {
        harness_with(config, FakeFactory::new(), FakeMirror::default())
    }

    type Seen = Arc<Mutex<Vec<(UploadStatus, f64)>>>;

    fn recorder() -> (Seen, FnObserver<impl Fn(UploadStatus, &UploadState) + Send + Sync>) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer = FnObserver::new(move |status, state: &UploadState| {
            sink.lock().unwrap().push((status, state.progress));
        });
        (seen, observer)
    }

    fn statuses(seen: &Seen) -> Vec<UploadStatus> {
        let mut statuses: Vec<UploadStatus> = seen.lock().unwrap().iter().map(|(s, _)| *s).collect();
        statuses.dedup();
        statuses
    }

    fn note() -> UploadRequest {
        UploadRequest::new("note.txt", "text/plain", Bytes::from_static(b"0123456789"))
    }

    #[tokio::test]
    async fn test_note_via_managed_cloud() {
        let mut config = Config::default();
        firebase_config(&mut config);
        let h = harness(config);
        let (seen, observer) = recorder();

        let record = h
            .coordinator
            .upload(&note(), &Principal::user("u1"), &observer)
            .await
            .unwrap();

        assert_eq!(
            statuses(&seen),
            vec![
                UploadStatus::Queued,
                UploadStatus::Uploading,
                UploadStatus::Processing,
                UploadStatus::Success
            ]
        );
        assert_eq!(seen.lock().unwrap().last().unwrap().1, 100.0);
        assert_eq!(record.name, "note.txt");
        assert_eq!(record.size, 10);
        assert!(record.url.starts_with("https://fake.local/download/uploads/"));
        assert_eq!(record.url, record.metadata.storage_path);
        assert_eq!(record.hash, hash_bytes(b"0123456789"));
        assert_eq!(h.factory.managed_cloud.object_count(), 1);
        assert_eq!(h.factory.object_storage.calls(), 0);
        assert!(h.mirror.contains(&record.hash));
    }

    #[tokio::test]
    async fn test_identical_upload_is_deduplicated() {
        let mut config = Config::default();
        firebase_config(&mut config);
        let h = harness(config);
        let principal = Principal::user("u1");
        let (_, observer) = recorder();

        let first = h.coordinator.upload(&note(), &principal, &observer).await.unwrap();
        let calls_after_first = h.factory.total_calls();
        let builds_after_first = h.factory.builds();

        let (seen, observer) = recorder();
        let second = h.coordinator.upload(&note(), &principal, &observer).await.unwrap();

        assert_eq!(h.factory.total_calls(), calls_after_first);
        assert_eq!(h.factory.builds(), builds_after_first);
        assert_ne!(first.id, second.id);
        assert_eq!(first.hash, second.hash);
        assert_eq!(first.metadata.storage_path, second.metadata.storage_path);
        assert_eq!(second.url, first.url);
        assert_eq!(h.records.len().await, 2);
        assert_eq!(
            statuses(&seen),
            vec![UploadStatus::Queued, UploadStatus::Processing, UploadStatus::Success]
        );
    }

    #[tokio::test]
    async fn test_restricted_runtime_without_object_storage_makes_no_calls() {
        let mut config = Config::default();
        firebase_config(&mut config);
        config.service.runtime = RuntimeKind::Edge;
        let h = harness(config);
        let (seen, observer) = recorder();

        let err = h
            .coordinator
            .upload(&note(), &Principal::anonymous(), &observer)
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Storage(StorageError::Configuration(_))));
        assert!(err.user_message().contains("restricted runtime"));
        assert!(!err.is_retryable());
        assert_eq!(h.factory.builds(), 0);
        assert_eq!(h.factory.total_calls(), 0);
        assert_eq!(h.mirror.len(), 0);
        assert_eq!(statuses(&seen), vec![UploadStatus::Queued, UploadStatus::Error]);
    }

    #[tokio::test]
    async fn test_restricted_runtime_uses_presigned_object_storage() {
        let mut config = Config::default();
        s3_config(&mut config);
        firebase_config(&mut config);
        config.service.runtime = RuntimeKind::Edge;
        let h = harness(config);
        let (_, observer) = recorder();

        let record = h
            .coordinator
            .upload(&note(), &Principal::anonymous(), &observer)
            .await
            .unwrap();

        assert!(record.url.starts_with("files/"));
        assert_eq!(h.factory.managed_cloud.calls(), 0);
        assert!(h.factory.object_storage.object(&record.url).is_some());
        assert!(h.mirror.contains(&record.hash));
    }

    #[tokio::test]
    async fn test_restricted_runtime_skips_mirror_when_disabled() {
        let mut config = Config::default();
        s3_config(&mut config);
        config.service.runtime = RuntimeKind::Edge;
        config.mirror.enabled = false;
        let h = harness(config);
        let (_, observer) = recorder();

        h.coordinator
            .upload(&note(), &Principal::anonymous(), &observer)
            .await
            .unwrap();

        assert_eq!(h.factory.object_storage.object_count(), 1);
        assert_eq!(h.mirror.len(), 0);
    }

    #[tokio::test]
    async fn test_direct_failure_falls_back_to_object_storage() {
        let mut config = Config::default();
        s3_config(&mut config);
        firebase_config(&mut config);
        let h = harness(config);
        h.factory
            .managed_cloud
            .push_resumable_failure(StorageError::network("connection reset"));
        let (seen, observer) = recorder();

        let record = h
            .coordinator
            .upload(&note(), &Principal::user("u1"), &observer)
            .await
            .unwrap();

        assert!(record.url.starts_with("files/"));
        assert_eq!(h.factory.object_storage.object_count(), 1);
        assert_eq!(h.factory.managed_cloud.object_count(), 0);
        assert_eq!(statuses(&seen).last(), Some(&UploadStatus::Success));
    }

    #[tokio::test]
    async fn test_last_error_wins_when_every_strategy_fails() {
        let mut config = Config::default();
        s3_config(&mut config);
        firebase_config(&mut config);
        let h = harness(config);
        h.factory
            .managed_cloud
            .push_resumable_failure(StorageError::network("reset"));
        h.factory.object_storage.push_put_failure(StorageError::RemoteRejection {
            key: "k".into(),
            status: 500,
            message: "boom".into(),
        });
        let (seen, observer) = recorder();

        let err = h
            .coordinator
            .upload(&note(), &Principal::user("u1"), &observer)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::Storage(StorageError::RemoteRejection { status: 500, .. })
        ));
        assert_eq!(statuses(&seen).last(), Some(&UploadStatus::Error));
        assert_eq!(h.records.len().await, 0);
    }

    #[tokio::test]
    async fn test_presigned_object_storage_when_only_s3_configured() {
        let mut config = Config::default();
        s3_config(&mut config);
        let h = harness(config);
        let (_, observer) = recorder();

        h.coordinator
            .upload(&note(), &Principal::anonymous(), &observer)
            .await
            .unwrap();

        assert_eq!(h.factory.object_storage.object_count(), 1);
        assert_eq!(h.factory.managed_cloud.calls(), 0);
    }

    #[tokio::test]
    async fn test_mirror_only_when_nothing_configured() {
        let h = harness(Config::default());
        let (_, observer) = recorder();

        let record = h
            .coordinator
            .upload(&note(), &Principal::anonymous(), &observer)
            .await
            .unwrap();

        assert_eq!(record.url, format!("mirror://{}", record.hash));
        assert!(h.mirror.contains(&record.hash));
        assert_eq!(h.factory.builds(), 0);
    }

    #[tokio::test]
    async fn test_client_mode_rejects_non_images_for_mirror() {
        let mut config = Config::default();
        config.service.deployment_mode = DeploymentMode::Client;
        let h = harness(config);
        let (_, observer) = recorder();

        let err = h
            .coordinator
            .upload(&note(), &Principal::anonymous(), &observer)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::UnsupportedFileType { ref extension } if extension == "txt"));
        assert_eq!(h.mirror.len(), 0);

        let image = UploadRequest::new("a.png", "image/png", Bytes::from_static(b"\x89PNG"));
        h.coordinator
            .upload(&image, &Principal::anonymous(), &observer)
            .await
            .unwrap();

        let forced = note().skip_file_type_check();
        h.coordinator
            .upload(&forced, &Principal::anonymous(), &observer)
            .await
            .unwrap();
        assert_eq!(h.mirror.len(), 2);
    }

    #[tokio::test]
    async fn test_mirror_failure_does_not_fail_remote_upload() {
        let mut config = Config::default();
        s3_config(&mut config);
        let h = harness_with(config, FakeFactory::new(), FakeMirror::failing());
        let (_, observer) = recorder();

        let record = h
            .coordinator
            .upload(&note(), &Principal::anonymous(), &observer)
            .await;
        tokio_test::assert_ok!(record);
    }

    #[tokio::test]
    async fn test_upload_with_retry_recovers_from_network_error() {
        let mut config = Config::default();
        s3_config(&mut config);
        let h = harness(config);
        h.factory
            .object_storage
            .push_put_failure(StorageError::network("timeout"));
        let (seen, observer) = recorder();

        let record = h
            .coordinator
            .upload_with_retry(&note(), &Principal::anonymous(), &observer)
            .await
            .unwrap();
        assert!(record.url.starts_with("files/"));
        assert_eq!(h.records.len().await, 1);

        let seen_statuses: Vec<UploadStatus> = seen.lock().unwrap().iter().map(|(s, _)| *s).collect();
        assert_eq!(
            seen_statuses.iter().filter(|s| **s == UploadStatus::Queued).count(),
            1
        );
        assert!(!seen_statuses.contains(&UploadStatus::Error));
        assert_eq!(
            statuses(&seen),
            vec![
                UploadStatus::Queued,
                UploadStatus::Uploading,
                UploadStatus::Processing,
                UploadStatus::Success
            ]
        );
    }

    #[tokio::test]
    async fn test_upload_with_retry_gives_up_on_permanent_error() {
        let mut config = Config::default();
        s3_config(&mut config);
        let h = harness(config);
        h.factory.object_storage.push_put_failure(StorageError::Permission {
            key: "k".into(),
            message: "denied".into(),
        });
        let (seen, observer) = recorder();

        let err = h
            .coordinator
            .upload_with_retry(&note(), &Principal::anonymous(), &observer)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Storage(StorageError::Permission { .. })));
        assert_eq!(statuses(&seen).last(), Some(&UploadStatus::Error));
        assert_eq!(
            seen.lock().unwrap().iter().filter(|(s, _)| *s == UploadStatus::Error).count(),
            1
        );
        // one presign plus one failed PUT
        assert_eq!(h.factory.object_storage.calls(), 2);
    }

    #[tokio::test]
    async fn test_read_content_from_mirror_path() {
        let h = harness(Config::default());
        let (_, observer) = recorder();
        let record = h
            .coordinator
            .upload(&note(), &Principal::anonymous(), &observer)
            .await
            .unwrap();

        let bytes = h
            .coordinator
            .read_content(&record.url, None, &Principal::anonymous())
            .await
            .unwrap();
        assert_eq!(bytes, Bytes::from_static(b"0123456789"));
        assert_eq!(h.factory.builds(), 0);
    }

    #[tokio::test]
    async fn test_read_content_from_selected_backend() {
        let mut config = Config::default();
        s3_config(&mut config);
        let h = harness(config);
        h.factory.object_storage.insert("files/a.txt", b"remote");

        let bytes = h
            .coordinator
            .read_content("files/a.txt", None, &Principal::anonymous())
            .await
            .unwrap();
        assert_eq!(bytes, Bytes::from_static(b"remote"));
        assert_eq!(h.factory.object_storage.calls(), 1);
    }

    #[tokio::test]
    async fn test_read_content_falls_back_to_mirror_by_hash() {
        let mut config = Config::default();
        s3_config(&mut config);
        let h = harness(config);
        let hash = hash_bytes(b"kept locally");
        h.mirror
            .put(&hash, &Bytes::from_static(b"kept locally"))
            .await
            .unwrap();

        let bytes = h
            .coordinator
            .read_content("files/gone.txt", Some(&hash), &Principal::anonymous())
            .await
            .unwrap();
        assert_eq!(bytes, Bytes::from_static(b"kept locally"));

        let err = h
            .coordinator
            .read_content("files/gone.txt", None, &Principal::anonymous())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Storage(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_read_content_unreachable_url_falls_back_to_mirror() {
        let h = harness(Config::default());
        let hash = hash_bytes(b"offline copy");
        h.mirror
            .put(&hash, &Bytes::from_static(b"offline copy"))
            .await
            .unwrap();

        let bytes = h
            .coordinator
            .read_content(
                "http://127.0.0.1:1/download/a.txt",
                Some(&hash),
                &Principal::anonymous(),
            )
            .await
            .unwrap();
        assert_eq!(bytes, Bytes::from_static(b"offline copy"));
    }

    #[tokio::test]
    async fn test_read_content_missing_mirror_entry() {
        let h = harness(Config::default());
        let missing = mirror_storage_path(&hash_bytes(b"never stored"));

        let err = h
            .coordinator
            .read_content(&missing, None, &Principal::anonymous())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Storage(StorageError::NotFound { ref key }) if key == &missing));
    }

    #[tokio::test]
    async fn test_hash_lookup_failure_is_surfaced() {
        let mut records = MockFileRecordService::new();
        records
            .expect_check_file_hash()
            .returning(|_| Err(anyhow::anyhow!("database unavailable")));
        records.expect_create_file().never();

        let factory = Arc::new(FakeFactory::new());
        let coordinator = UploadCoordinator::new(
            Arc::new(StaticEnvironment(Config::default())),
            factory.clone(),
            Arc::new(records),
            Arc::new(FakeMirror::default()),
        );
        let (_, observer) = recorder();

        let err = coordinator
            .upload(&note(), &Principal::anonymous(), &observer)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Records(ref msg) if msg.contains("database unavailable")));
        assert_eq!(factory.builds(), 0);
    }

    #[tokio::test]
    async fn test_dedup_record_points_at_prior_path() {
        let prior = FileMetadata {
            content_hash: hash_bytes(b"0123456789"),
            storage_path: "files/475000/prior.txt".into(),
            dirname: "files/475000".into(),
            filename: "prior.txt".into(),
            original_filename: "note.txt".into(),
            mime_type: "text/plain".into(),
            size_bytes: 10,
            created_at_bucket: 475_000,
        };
        let expected_hash = prior.content_hash.clone();

        let mut records = MockFileRecordService::new();
        let found = prior.clone();
        records
            .expect_check_file_hash()
            .withf(move |hash| *hash == expected_hash)
            .times(1)
            .returning(move |_| Ok(HashCheck::found(found.clone())));
        records
            .expect_create_file()
            .withf(|new| new.url == "files/475000/prior.txt" && new.name == "note.txt")
            .times(1)
            .returning(|new| {
                Ok(FileRecord {
                    id: uuid::Uuid::new_v4(),
                    url: new.url,
                    name: new.name,
                    hash: new.hash,
                    size: new.size,
                    file_type: new.file_type,
                    metadata: new.metadata,
                    created_at: Utc::now(),
                })
            });

        let factory = Arc::new(FakeFactory::new());
        let coordinator = UploadCoordinator::new(
            Arc::new(StaticEnvironment(Config::default())),
            factory.clone(),
            Arc::new(records),
            Arc::new(FakeMirror::default()),
        );
        let (_, observer) = recorder();

        let record = coordinator
            .upload(&note(), &Principal::anonymous(), &observer)
            .await
            .unwrap();
        assert_eq!(record.metadata, prior);
        assert_eq!(factory.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_events_stream_ends_with_completion() {
        let mut config = Config::default();
        firebase_config(&mut config);
        let h = harness(config);

        let events: Vec<UploadEvent> = h
            .coordinator
            .events(note(), Principal::user("u1"))
            .collect()
            .await;

        assert!(matches!(
            events.first(),
            Some(UploadEvent::Progress { status: UploadStatus::Queued, .. })
        ));
        assert!(matches!(events.last(), Some(UploadEvent::Completed(r)) if r.name == "note.txt"));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_upload_data_uri() {
        let mut config = Config::default();
        s3_config(&mut config);
        let h = harness(config);
        let (_, observer) = recorder();
        let data_uri = format!("data:image/jpeg;base64,{}", STANDARD.encode(b"jpeg bytes"));

        let upload = h
            .coordinator
            .upload_data_uri(&data_uri, Some("photo"), &Principal::anonymous(), &observer)
            .await
            .unwrap();

        assert_eq!(upload.file_type, "image/jpeg");
        assert_eq!(upload.size, 10);
        assert_eq!(upload.hash, hash_bytes(b"jpeg bytes"));
        assert_eq!(upload.record.name, "photo.jpeg");
        assert!(upload.metadata.filename.ends_with(".jpeg"));
    }

    #[test]
    fn test_parse_data_uri_rejects_malformed_input() {
        for uri in [
            "image/png;base64,AAAA",
            "data:image/png;base64",
            "data:;base64,AAAA",
            "data:image/png,AAAA",
            "data:image/png;base64,@@@",
        ] {
            assert!(
                matches!(parse_data_uri(uri), Err(UploadError::InvalidDataUri(_))),
                "{uri} should be rejected"
            );
        }
    }

    #[test]
    fn test_data_uri_file_name() {
        assert_eq!(data_uri_file_name(Some("cat"), "image/webp"), "cat.webp");
        assert_eq!(data_uri_file_name(Some("cat"), "image"), "cat.png");

        let generated = data_uri_file_name(None, "image/png");
        assert!(generated.starts_with("image_"));
        assert!(generated.ends_with(".png"));
        // image_YYYY-MM-DD-hh-mm-ss.png
        assert_eq!(generated.len(), "image_2024-01-15-10-30-00.png".len());
    }
}
