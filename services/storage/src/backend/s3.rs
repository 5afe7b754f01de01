use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::delete_objects::DeleteObjectsOutput;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::scope::validate_key;
use super::{DeleteOutcome, DeleteReport, ObjectInfo, StorageBackend};
use crate::config::S3Config;
use crate::error::StorageError;
use crate::selector::BackendKind;
use crate::transfer::{self, TransferProgress};

/// S3 caps DeleteObjects at 1000 keys per request
const MAX_BATCH_DELETE: usize = 1000;

/// HEAD requests in flight while sorting out absent keys
const EXISTENCE_CHECK_CONCURRENCY: usize = 16;

/// S3-compatible object storage backend
pub struct S3Backend {
    client: S3Client,
    http: reqwest::Client,
    bucket: String,
    config: S3Config,
    chunk_size: usize,
}

impl S3Backend {
    /// Create a new S3 backend from static credentials
    pub async fn new(
        config: &S3Config,
        http: reqwest::Client,
        chunk_size: usize,
    ) -> Result<Self, StorageError> {
        let (Some(access_key), Some(secret), Some(bucket)) = (
            config.access_key_id.as_ref(),
            config.secret_access_key.as_ref(),
            config.bucket.as_ref(),
        ) else {
            return Err(StorageError::NotInitialized { backend: "S3" });
        };

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(Credentials::new(
                access_key.clone(),
                secret.clone(),
                None,
                None,
                "dropline-config",
            ))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/R2
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %bucket,
            region = %config.region,
            "S3 backend initialized"
        );

        Ok(Self {
            client,
            http,
            bucket: bucket.clone(),
            config: config.clone(),
            chunk_size,
        })
    }

    fn default_expiry(&self) -> Duration {
        Duration::from_secs(self.config.presigned_url_expiry_secs)
    }

    /// Public URL when the bucket is readable without signing
    fn public_url(&self, key: &str) -> Option<String> {
        if !self.config.set_acl {
            return None;
        }
        let domain = self.config.public_domain.as_deref()?;
        Some(public_object_url(
            domain,
            &self.bucket,
            key,
            self.config.force_path_style,
        ))
    }

    async fn presigned_get(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        let presigning_config = presigning_config(expires_in)?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| map_sdk_error(key, e))?;
        Ok(presigned.uri().to_string())
    }

    /// Check if an object exists
    pub async fn object_exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
                    Ok(false)
                } else {
                    Err(map_sdk_error(key, e))
                }
            }
        }
    }

    /// One `DeleteObjects` request for at most [`MAX_BATCH_DELETE`] keys
    async fn delete_batch(&self, batch: &[String]) -> Result<DeleteObjectsOutput, StorageError> {
        let objects = batch
            .iter()
            .map(|key| {
                ObjectIdentifier::builder()
                    .key(key)
                    .build()
                    .map_err(|e| StorageError::invalid_key(key.clone(), e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(false)
            .build()
            .map_err(|e| StorageError::Configuration(e.to_string()))?;

        self.client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| map_sdk_error(&batch.join(","), e))
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::ObjectStorage
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn presign_upload(&self, key: &str) -> Result<String, StorageError> {
        validate_key(key)?;
        let presigning_config = presigning_config(self.default_expiry())?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| map_sdk_error(key, e))?;

        debug!(key = %key, "Created presigned upload URL");
        Ok(presigned.uri().to_string())
    }

    async fn put_presigned(
        &self,
        target: &str,
        data: Bytes,
        content_type: &str,
        progress: &dyn TransferProgress,
    ) -> Result<(), StorageError> {
        transfer::put_with_progress(
            &self.http,
            target,
            target,
            data,
            content_type,
            self.chunk_size,
            progress,
        )
        .await
    }

    async fn presign_preview(
        &self,
        key: &str,
        expires_in: Option<Duration>,
    ) -> Result<String, StorageError> {
        validate_key(key)?;
        if let Some(url) = self.public_url(key) {
            return Ok(url);
        }
        self.presigned_get(key, expires_in.unwrap_or_else(|| self.default_expiry()))
            .await
    }

    #[instrument(skip(self, data), fields(bucket = %self.bucket, size_bytes = data.len()))]
    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        validate_key(path)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(ByteStream::from(data))
            .content_type(content_type.unwrap_or("application/octet-stream"))
            .send()
            .await
            .map_err(|e| map_sdk_error(path, e))?;

        info!(key = %path, "Object uploaded to S3");
        Ok(())
    }

    async fn file_url(&self, key: &str) -> Result<String, StorageError> {
        self.presign_preview(key, None).await
    }

    async fn get_bytes(&self, key: &str) -> Result<Bytes, StorageError> {
        let url = self.file_url(key).await?;
        transfer::fetch_bytes(&self.http, key, &url).await
    }

    async fn get_content(&self, key: &str) -> Result<String, StorageError> {
        let url = self.file_url(key).await?;
        transfer::fetch_text(&self.http, key, &url).await
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn delete(&self, key: &str) -> Result<DeleteOutcome, StorageError> {
        validate_key(key)?;
        // S3 deletes are silent for missing keys, so look first
        if !self.object_exists(key).await? {
            debug!(key = %key, "Object already absent");
            return Ok(DeleteOutcome::Missing);
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(key, e))?;

        debug!(key = %key, "Object deleted from S3");
        Ok(DeleteOutcome::Deleted)
    }

    /// Delete `keys`, reporting absent ones as missing.
    ///
    /// `DeleteObjects` acknowledges keys that never existed, so existence is
    /// checked with HEAD first. Every key is attempted; per-key failures are
    /// aggregated into [`StorageError::BatchDelete`].
    #[instrument(skip(self, keys), fields(bucket = %self.bucket, count = keys.len()))]
    async fn delete_many(&self, keys: &[String]) -> Result<DeleteReport, StorageError> {
        let mut report = DeleteReport::default();
        let mut failures = Vec::new();

        let mut valid = Vec::with_capacity(keys.len());
        for key in keys {
            match validate_key(key) {
                Ok(()) => valid.push(key.clone()),
                Err(e) => failures.push((key.clone(), e)),
            }
        }

        // Results come back in the order of `keys`
        let checked: Vec<(String, Result<bool, StorageError>)> = stream::iter(valid)
            .map(|key| async move {
                let exists = self.object_exists(&key).await;
                (key, exists)
            })
            .buffered(EXISTENCE_CHECK_CONCURRENCY)
            .collect()
            .await;

        let mut present = Vec::with_capacity(checked.len());
        for (key, exists) in checked {
            match exists {
                Ok(true) => present.push(key),
                Ok(false) => report.missing.push(key),
                Err(e) => failures.push((key, e)),
            }
        }

        for batch in present.chunks(MAX_BATCH_DELETE) {
            let output = match self.delete_batch(batch).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(error = %e, keys = batch.len(), "DeleteObjects request failed");
                    failures.extend(batch.iter().map(|key| (key.clone(), e.clone())));
                    continue;
                }
            };

            report
                .deleted
                .extend(output.deleted().iter().filter_map(|d| d.key().map(String::from)));

            for error in output.errors() {
                let key = error.key().unwrap_or_default().to_string();
                let message = error.message().unwrap_or("delete failed").to_string();
                let err = match error.code() {
                    Some("AccessDenied") => StorageError::Permission {
                        key: key.clone(),
                        message,
                    },
                    // Raced with another delete after the HEAD check
                    Some("NoSuchKey") => {
                        report.missing.push(key);
                        continue;
                    }
                    _ => StorageError::RemoteRejection {
                        key: key.clone(),
                        status: 500,
                        message,
                    },
                };
                failures.push((key, err));
            }
        }

        if !report.missing.is_empty() {
            info!(missing = ?report.missing, "Some objects were already absent");
        }

        if failures.is_empty() {
            info!(deleted = report.deleted.len(), "Batch delete completed");
            Ok(report)
        } else {
            Err(StorageError::BatchDelete { failures })
        }
    }

    /// List objects under `prefix`, following continuation tokens
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(prefix.map(String::from))
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(prefix.unwrap_or(""), e))?;

            objects.extend(response.contents().iter().filter_map(|obj| {
                let key = obj.key()?.to_string();
                let last_modified = obj
                    .last_modified()
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()));
                Some(ObjectInfo {
                    key,
                    last_modified,
                    size: obj.size().unwrap_or(0).max(0) as u64,
                })
            }));

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(objects)
    }
}

fn presigning_config(expires_in: Duration) -> Result<PresigningConfig, StorageError> {
    PresigningConfig::expires_in(expires_in)
        .map_err(|e| StorageError::Configuration(format!("invalid presign expiry: {e}")))
}

/// Map an SDK failure onto the storage error taxonomy
fn map_sdk_error<E>(key: &str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => StorageError::network(message),
        SdkError::ConstructionFailure(_) => StorageError::Configuration(message),
        _ => match err
            .raw_response()
            .and_then(|r| StatusCode::from_u16(r.status().as_u16()).ok())
        {
            Some(status) => transfer::classify_status(key, status, message),
            None => StorageError::network(message),
        },
    }
}

/// Object storage key: `{directory}/{hour_bucket}/{file_name}`
pub fn partitioned_key(directory: &str, hour_bucket: i64, file_name: &str) -> String {
    format!(
        "{}/{hour_bucket}/{file_name}",
        directory.trim_matches('/')
    )
}

/// Public URL for `key` on `domain`, honouring path-style buckets
pub fn public_object_url(domain: &str, bucket: &str, key: &str, path_style: bool) -> String {
    let domain = domain.trim_end_matches('/');
    let key = key.trim_start_matches('/');
    if path_style {
        format!("{domain}/{}/{key}", bucket.trim_matches('/'))
    } else {
        format!("{domain}/{key}")
    }
}
