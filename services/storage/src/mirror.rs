//! Content-addressed local mirror of uploaded bytes.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::StorageError;
use crate::hasher::is_content_hash;

/// `storage_path` prefix for objects held only by the mirror
pub const MIRROR_SCHEME: &str = "mirror://";

/// Local store keyed by content hash
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Store `data` under `hash`. Existing content is left untouched.
    async fn put(&self, hash: &str, data: &Bytes) -> Result<(), StorageError>;

    async fn get(&self, hash: &str) -> Result<Option<Bytes>, StorageError>;
}

/// Mirror path recorded in file metadata
pub fn mirror_storage_path(hash: &str) -> String {
    format!("{MIRROR_SCHEME}{hash}")
}

/// Filesystem mirror laid out as `{root}/{hash[0..2]}/{hash}`
#[derive(Debug, Clone)]
pub struct FsMirror {
    root: PathBuf,
}

impl FsMirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, hash: &str) -> Result<PathBuf, StorageError> {
        if !is_content_hash(hash) {
            return Err(StorageError::invalid_key(hash, "not a sha256 hex digest"));
        }
        Ok(self.root.join(&hash[..2]).join(hash))
    }
}

fn io_error(hash: &str, err: std::io::Error) -> StorageError {
    match err.kind() {
        ErrorKind::PermissionDenied => StorageError::Permission {
            key: hash.to_string(),
            message: err.to_string(),
        },
        _ => StorageError::network(format!("mirror I/O failed for {hash}: {err}")),
    }
}

#[async_trait]
impl MirrorStore for FsMirror {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn put(&self, hash: &str, data: &Bytes) -> Result<(), StorageError> {
        let path = self.object_path(hash)?;
        if fs::try_exists(&path).await.map_err(|e| io_error(hash, e))? {
            debug!("Mirror already holds content");
            return Ok(());
        }

        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)
            .await
            .map_err(|e| io_error(hash, e))?;

        // Readers never observe a partial file
        let tmp = dir.join(format!(".{hash}.{}.tmp", Uuid::new_v4()));
        if let Err(e) = fs::write(&tmp, data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_error(hash, e));
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_error(hash, e));
        }

        debug!(path = %path.display(), "Mirrored content");
        Ok(())
    }

    async fn get(&self, hash: &str) -> Result<Option<Bytes>, StorageError> {
        let path = self.object_path(hash)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(hash, e)),
        }
    }
}
