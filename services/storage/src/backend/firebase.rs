//! Firebase Storage over its REST API.
//!
//! Objects are addressed as `/v0/b/{bucket}/o/{url-encoded path}` and every
//! path is resolved inside the caller's `users/{uid}/` namespace. Large
//! writes use the resumable protocol: a `start` request opens a session,
//! chunks are sent with `upload` and the last one with `upload, finalize`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Datelike, Timelike, Utc};
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::scope::{validate_key, Principal};
use super::{
    delete_individually, DeleteOutcome, DeleteReport, ObjectInfo, ResumableUpload, StorageBackend,
};
use crate::config::FirebaseConfig;
use crate::error::StorageError;
use crate::selector::BackendKind;
use crate::transfer::{self, TransferProgress};

const UPLOAD_PROTOCOL: &str = "x-goog-upload-protocol";
const UPLOAD_COMMAND: &str = "x-goog-upload-command";
const UPLOAD_OFFSET: &str = "x-goog-upload-offset";
const UPLOAD_URL: &str = "x-goog-upload-url";
const UPLOAD_CONTENT_LENGTH: &str = "x-goog-upload-header-content-length";
const UPLOAD_CONTENT_TYPE: &str = "x-goog-upload-header-content-type";

/// Default directory for direct uploads
pub const DEFAULT_DIRECTORY: &str = "uploads";

/// Metadata requests in flight while listing
const METADATA_CONCURRENCY: usize = 8;

/// Object metadata as returned by the REST API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMetadata {
    name: String,
    /// Sizes are encoded as decimal strings
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    updated: Option<String>,
    /// Comma separated list of download tokens
    #[serde(default)]
    download_tokens: Option<String>,
}

impl ObjectMetadata {
    fn size_bytes(&self) -> u64 {
        self.size
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        let updated = self.updated.as_deref()?;
        DateTime::parse_from_rfc3339(updated)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    fn download_token(&self) -> Option<&str> {
        self.download_tokens
            .as_deref()
            .and_then(|tokens| tokens.split(',').next())
            .filter(|token| !token.is_empty())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    name: String,
}

/// Firebase Storage backend bound to one principal
pub struct FirebaseBackend {
    http: Client,
    endpoint: Url,
    bucket: String,
    principal: Principal,
    chunk_size: usize,
}

impl FirebaseBackend {
    pub fn new(
        config: &FirebaseConfig,
        principal: Principal,
        http: Client,
        chunk_size: usize,
    ) -> Result<Self, StorageError> {
        if !config.is_configured() {
            return Err(StorageError::NotInitialized {
                backend: "Firebase",
            });
        }
        let bucket = config
            .storage_bucket
            .clone()
            .ok_or(StorageError::NotInitialized {
                backend: "Firebase",
            })?;
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            StorageError::Configuration(format!("invalid Firebase endpoint {:?}: {e}", config.endpoint))
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(StorageError::Configuration(format!(
                "Firebase endpoint {:?} cannot be a base URL",
                config.endpoint
            )));
        }

        debug!(bucket = %bucket, uid = ?principal.uid, "Firebase backend initialized");

        Ok(Self {
            http,
            endpoint,
            bucket,
            principal,
            chunk_size,
        })
    }

    /// `{endpoint}/v0/b/{bucket}/o`
    fn objects_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v0", "b", self.bucket.as_str(), "o"]);
        }
        url
    }

    /// `{endpoint}/v0/b/{bucket}/o/{full_path}` with `/` encoded as `%2F`
    fn object_url(&self, full_path: &str) -> Url {
        let mut url = self.objects_url();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(full_path);
        }
        url
    }

    /// Tokenized URL that serves the object without authentication
    fn download_url(&self, full_path: &str, token: &str) -> String {
        let mut url = self.object_url(full_path);
        url.query_pairs_mut()
            .append_pair("alt", "media")
            .append_pair("token", token);
        url.to_string()
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match self.principal.id_token.as_deref() {
            Some(token) => builder.header(AUTHORIZATION, format!("Firebase {token}")),
            None => builder,
        }
    }

    /// Ensure a full path sits inside this principal's namespace
    fn check_owned(&self, full_path: &str) -> Result<(), StorageError> {
        match self.principal.relative_key(full_path) {
            Some(rest) => validate_key(rest),
            None => Err(StorageError::Permission {
                key: full_path.to_string(),
                message: "path is outside the caller's namespace".to_string(),
            }),
        }
    }

    async fn metadata(&self, full_path: &str) -> Result<ObjectMetadata, StorageError> {
        let response = self
            .request(Method::GET, self.object_url(full_path))
            .send()
            .await
            .map_err(|e| transfer::classify_reqwest(full_path, e))?;
        let response = transfer::ensure_success(full_path, response).await?;
        response
            .json()
            .await
            .map_err(|e| transfer::classify_reqwest(full_path, e))
    }

    async fn resolve_download_url(&self, full_path: &str) -> Result<String, StorageError> {
        let metadata = self.metadata(full_path).await?;
        let token = metadata
            .download_token()
            .ok_or_else(|| StorageError::Permission {
                key: full_path.to_string(),
                message: "object has no download token".to_string(),
            })?;
        Ok(self.download_url(&metadata.name, token))
    }

    async fn start_session(
        &self,
        full_path: &str,
        total: u64,
        content_type: &str,
    ) -> Result<Url, StorageError> {
        let mut url = self.objects_url();
        url.query_pairs_mut()
            .append_pair("name", full_path)
            .append_pair("uploadType", "resumable");

        let response = self
            .request(Method::POST, url)
            .header(UPLOAD_PROTOCOL, "resumable")
            .header(UPLOAD_COMMAND, "start")
            .header(UPLOAD_CONTENT_LENGTH, total)
            .header(UPLOAD_CONTENT_TYPE, content_type)
            .json(&serde_json::json!({ "name": full_path, "contentType": content_type }))
            .send()
            .await
            .map_err(|e| transfer::classify_reqwest(full_path, e))?;
        let response = transfer::ensure_success(full_path, response).await?;

        session_url(full_path, response.headers())
    }

    /// Resumable upload to an already scoped path
    async fn upload_resumable_to(
        &self,
        full_path: &str,
        data: Bytes,
        content_type: &str,
        progress: &dyn TransferProgress,
    ) -> Result<ObjectMetadata, StorageError> {
        let total = data.len() as u64;
        let session = self.start_session(full_path, total, content_type).await?;

        let chunks = transfer::chunk_slices(&data, self.chunk_size);
        let last = chunks.len() - 1;
        let mut offset = 0u64;
        let mut finished = None;

        for (index, chunk) in chunks.into_iter().enumerate() {
            let len = chunk.len() as u64;
            let command = if index == last { "upload, finalize" } else { "upload" };

            let response = self
                .request(Method::POST, session.clone())
                .header(UPLOAD_PROTOCOL, "resumable")
                .header(UPLOAD_COMMAND, command)
                .header(UPLOAD_OFFSET, offset)
                .body(chunk)
                .send()
                .await
                .map_err(|e| transfer::classify_reqwest(full_path, e))?;
            let response = transfer::ensure_success(full_path, response).await?;

            offset += len;
            progress.on_transfer(offset, total);

            if index == last {
                finished = Some(
                    response
                        .json::<ObjectMetadata>()
                        .await
                        .map_err(|e| transfer::classify_reqwest(full_path, e))?,
                );
            }
        }

        info!(path = %full_path, size_bytes = total, "Resumable upload finalized");
        finished.ok_or_else(|| StorageError::network("resumable upload ended without a response"))
    }
}

#[async_trait]
impl StorageBackend for FirebaseBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ManagedCloud
    }

    /// Firebase has no presigned URLs; the scoped path is the upload target
    async fn presign_upload(&self, key: &str) -> Result<String, StorageError> {
        self.principal.scoped_path(key)
    }

    #[instrument(skip(self, data, progress), fields(size_bytes = data.len()))]
    async fn put_presigned(
        &self,
        target: &str,
        data: Bytes,
        content_type: &str,
        progress: &dyn TransferProgress,
    ) -> Result<(), StorageError> {
        self.check_owned(target)?;
        self.upload_resumable_to(target, data, content_type, progress)
            .await
            .map(|_| ())
    }

    /// Download URLs are token based and do not expire
    async fn presign_preview(
        &self,
        key: &str,
        expires_in: Option<Duration>,
    ) -> Result<String, StorageError> {
        if expires_in.is_some() {
            debug!(key = %key, "Ignoring expiry for tokenized Firebase URL");
        }
        self.file_url(key).await
    }

    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        let full_path = self.principal.scoped_path(path)?;
        let mut url = self.objects_url();
        url.query_pairs_mut().append_pair("name", &full_path);

        let response = self
            .request(Method::POST, url)
            .header(CONTENT_TYPE, content_type.unwrap_or("application/octet-stream"))
            .body(data)
            .send()
            .await
            .map_err(|e| transfer::classify_reqwest(&full_path, e))?;
        transfer::ensure_success(&full_path, response).await?;

        info!(path = %full_path, "Object uploaded to Firebase");
        Ok(())
    }

    async fn file_url(&self, key: &str) -> Result<String, StorageError> {
        let full_path = self.principal.scoped_path(key)?;
        self.resolve_download_url(&full_path).await
    }

    async fn get_bytes(&self, key: &str) -> Result<Bytes, StorageError> {
        let full_path = self.principal.scoped_path(key)?;
        let mut url = self.object_url(&full_path);
        url.query_pairs_mut().append_pair("alt", "media");

        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(|e| transfer::classify_reqwest(&full_path, e))?;
        let response = transfer::ensure_success(&full_path, response).await?;
        response
            .bytes()
            .await
            .map_err(|e| transfer::classify_reqwest(&full_path, e))
    }

    async fn get_content(&self, key: &str) -> Result<String, StorageError> {
        let bytes = self.get_bytes(key).await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| StorageError::RemoteRejection {
            key: key.to_string(),
            status: StatusCode::OK.as_u16(),
            message: format!("object is not valid UTF-8: {e}"),
        })
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<DeleteOutcome, StorageError> {
        let full_path = self.principal.scoped_path(key)?;
        let response = self
            .request(Method::DELETE, self.object_url(&full_path))
            .send()
            .await
            .map_err(|e| transfer::classify_reqwest(&full_path, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(path = %full_path, "Object already absent");
            return Ok(DeleteOutcome::Missing);
        }
        transfer::ensure_success(&full_path, response).await?;

        debug!(path = %full_path, "Object deleted from Firebase");
        Ok(DeleteOutcome::Deleted)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<DeleteReport, StorageError> {
        delete_individually(keys, |key| async move { self.delete(&key).await }).await
    }

    /// List the principal's objects with their real size and update time
    #[instrument(skip(self))]
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<ObjectInfo>, StorageError> {
        let root = self.principal.root()?;
        let full_prefix = match prefix.map(|p| p.trim_end_matches('/')) {
            Some(p) if !p.is_empty() => {
                validate_key(p)?;
                format!("{root}/{p}")
            }
            _ => format!("{root}/"),
        };

        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.objects_url();
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", &full_prefix);
                if let Some(token) = page_token.as_deref() {
                    query.append_pair("pageToken", token);
                }
            }

            let response = self
                .request(Method::GET, url)
                .send()
                .await
                .map_err(|e| transfer::classify_reqwest(&full_prefix, e))?;
            let response = transfer::ensure_success(&full_prefix, response).await?;
            let page: ListResponse = response
                .json()
                .await
                .map_err(|e| transfer::classify_reqwest(&full_prefix, e))?;

            names.extend(page.items.into_iter().map(|item| item.name));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        let fetched: Vec<(String, Result<ObjectMetadata, StorageError>)> = stream::iter(names)
            .map(|name| async move {
                let metadata = self.metadata(&name).await;
                (name, metadata)
            })
            .buffered(METADATA_CONCURRENCY)
            .collect()
            .await;

        let mut objects = Vec::with_capacity(fetched.len());
        for (name, metadata) in fetched {
            let meta = match metadata {
                Ok(meta) => meta,
                // Deleted between the listing and the metadata request
                Err(StorageError::NotFound { .. }) => {
                    debug!(path = %name, "Listed object vanished before its metadata was read");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some(key) = self.principal.relative_key(&meta.name) else {
                warn!(path = %meta.name, "Skipping object outside the caller's namespace");
                continue;
            };
            objects.push(ObjectInfo {
                key: key.to_string(),
                last_modified: meta.updated_at(),
                size: meta.size_bytes(),
            });
        }

        Ok(objects)
    }

    fn as_resumable(&self) -> Option<&dyn ResumableUpload> {
        Some(self)
    }
}

#[async_trait]
impl ResumableUpload for FirebaseBackend {
    #[instrument(skip(self, data, progress), fields(size_bytes = data.len()))]
    async fn resumable_upload(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        progress: &dyn TransferProgress,
    ) -> Result<String, StorageError> {
        let full_path = self.principal.scoped_path(key)?;
        let metadata = self
            .upload_resumable_to(&full_path, data, content_type, progress)
            .await?;

        match metadata.download_token() {
            Some(token) => Ok(self.download_url(&metadata.name, token)),
            None => self.resolve_download_url(&full_path).await,
        }
    }
}

fn session_url(key: &str, headers: &HeaderMap) -> Result<Url, StorageError> {
    let value = headers
        .get(UPLOAD_URL)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| StorageError::RemoteRejection {
            key: key.to_string(),
            status: StatusCode::OK.as_u16(),
            message: "resumable session response is missing the upload URL".to_string(),
        })?;
    Url::parse(value).map_err(|e| StorageError::RemoteRejection {
        key: key.to_string(),
        status: StatusCode::OK.as_u16(),
        message: format!("invalid resumable session URL: {e}"),
    })
}

/// Date-partitioned key `{directory}/{Y}/{M}/{D}/{H}/{file_name}`
pub fn dated_key(directory: Option<&str>, at: DateTime<Utc>, file_name: &str) -> String {
    let directory = directory
        .map(|d| d.trim_matches('/'))
        .filter(|d| !d.is_empty())
        .unwrap_or(DEFAULT_DIRECTORY);
    format!(
        "{directory}/{}/{}/{}/{}/{file_name}",
        at.year(),
        at.month(),
        at.day(),
        at.hour()
    )
}
