//! HTTP transfer helpers shared by the storage backends.

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::StorageError;

/// Receives raw byte counts while a body is being sent
pub trait TransferProgress: Send + Sync {
    fn on_transfer(&self, transferred: u64, total: u64);
}

impl TransferProgress for () {
    fn on_transfer(&self, _transferred: u64, _total: u64) {}
}

/// Build the HTTP client used for presigned and REST transfers
pub fn build_client(timeout: Duration) -> Result<Client, StorageError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| StorageError::network(format!("failed to build HTTP client: {e}")))
}

/// Map a non-success HTTP status onto the error taxonomy
pub fn classify_status(key: &str, status: StatusCode, message: impl Into<String>) -> StorageError {
    let message = message.into();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StorageError::Permission {
            key: key.to_string(),
            message,
        },
        StatusCode::NOT_FOUND => StorageError::NotFound {
            key: key.to_string(),
        },
        _ => StorageError::RemoteRejection {
            key: key.to_string(),
            status: status.as_u16(),
            message,
        },
    }
}

/// Errors without an HTTP status never reached the remote
pub fn classify_reqwest(key: &str, err: reqwest::Error) -> StorageError {
    match err.status() {
        Some(status) => classify_status(key, status, err.to_string()),
        None => StorageError::network(err.to_string()),
    }
}

/// Fail with a classified error unless the response is 2xx
pub async fn ensure_success(
    key: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        body
    };
    Err(classify_status(key, status, message))
}

/// Split `data` into chunk slices without copying
pub fn chunk_slices(data: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    if data.is_empty() {
        return vec![Bytes::new()];
    }
    (0..data.len())
        .step_by(chunk_size)
        .map(|start| data.slice(start..(start + chunk_size).min(data.len())))
        .collect()
}

/// Binary PUT of `data` to `url`, reporting progress as the transport
/// pulls each chunk of the body.
pub async fn put_with_progress(
    client: &Client,
    key: &str,
    url: &str,
    data: Bytes,
    content_type: &str,
    chunk_size: usize,
    progress: &dyn TransferProgress,
) -> Result<(), StorageError> {
    let total = data.len() as u64;
    let (tx, mut rx) = mpsc::unbounded_channel::<u64>();

    let mut sent = 0u64;
    let body_stream = stream::iter(chunk_slices(&data, chunk_size)).map(move |chunk| {
        sent += chunk.len() as u64;
        let _ = tx.send(sent);
        Ok::<Bytes, std::io::Error>(chunk)
    });

    let request = client
        .put(url)
        .header(CONTENT_TYPE, content_type)
        .header(CONTENT_LENGTH, total)
        .body(reqwest::Body::wrap_stream(body_stream))
        .send();
    tokio::pin!(request);

    let response = loop {
        tokio::select! {
            result = &mut request => break result,
            Some(transferred) = rx.recv() => progress.on_transfer(transferred, total),
        }
    };

    let response = response.map_err(|e| classify_reqwest(key, e))?;
    ensure_success(key, response).await?;

    debug!(key = %key, size_bytes = total, "Presigned PUT completed");
    Ok(())
}

/// GET the bytes behind a resolved URL
pub async fn fetch_bytes(client: &Client, key: &str, url: &str) -> Result<Bytes, StorageError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| classify_reqwest(key, e))?;
    let response = ensure_success(key, response).await?;
    response.bytes().await.map_err(|e| classify_reqwest(key, e))
}

/// GET the text behind a resolved URL
pub async fn fetch_text(client: &Client, key: &str, url: &str) -> Result<String, StorageError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| classify_reqwest(key, e))?;
    let response = ensure_success(key, response).await?;
    response.text().await.map_err(|e| classify_reqwest(key, e))
}
