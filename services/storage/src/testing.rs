//! In-memory fakes for backends, factories and mirrors, plus a loopback
//! server for HTTP emulators.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{
    delete_individually, BackendFactory, DeleteOutcome, DeleteReport, ObjectInfo, Principal,
    ResumableUpload, StorageBackend,
};
use crate::config::Config;
use crate::error::StorageError;
use crate::mirror::MirrorStore;
use crate::selector::BackendKind;
use crate::transfer::{chunk_slices, TransferProgress};

const PRESIGN_PREFIX: &str = "https://fake.local/upload/";

/// Serve `router` on an ephemeral loopback port
pub async fn serve(router: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Backend keeping objects in memory and counting remote calls
pub struct FakeBackend {
    kind: BackendKind,
    chunk_size: usize,
    calls: AtomicUsize,
    objects: Mutex<BTreeMap<String, Bytes>>,
    put_failures: Mutex<VecDeque<StorageError>>,
    resumable_failures: Mutex<VecDeque<StorageError>>,
}

impl FakeBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            chunk_size: 1024,
            calls: AtomicUsize::new(0),
            objects: Mutex::new(BTreeMap::new()),
            put_failures: Mutex::new(VecDeque::new()),
            resumable_failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn object_storage() -> Self {
        Self::new(BackendKind::ObjectStorage)
    }

    pub fn managed_cloud() -> Self {
        Self::new(BackendKind::ManagedCloud)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Fail the next presigned transfer with `err`
    pub fn push_put_failure(&self, err: StorageError) {
        self.put_failures.lock().unwrap().push_back(err);
    }

    /// Fail the next resumable upload with `err`
    pub fn push_resumable_failure(&self, err: StorageError) {
        self.resumable_failures.lock().unwrap().push_back(err);
    }

    pub fn insert(&self, key: &str, data: &'static [u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), Bytes::from_static(data));
    }

    /// Number of calls that would have reached the network
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn store(&self, key: &str, data: Bytes, progress: &dyn TransferProgress) {
        let total = data.len() as u64;
        let mut sent = 0u64;
        for chunk in chunk_slices(&data, self.chunk_size) {
            sent += chunk.len() as u64;
            progress.on_transfer(sent, total);
        }
        self.objects.lock().unwrap().insert(key.to_string(), data);
    }
}

#[async_trait]
impl StorageBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn presign_upload(&self, key: &str) -> Result<String, StorageError> {
        self.hit();
        Ok(format!("{PRESIGN_PREFIX}{key}"))
    }

    async fn put_presigned(
        &self,
        target: &str,
        data: Bytes,
        _content_type: &str,
        progress: &dyn TransferProgress,
    ) -> Result<(), StorageError> {
        self.hit();
        if let Some(err) = self.put_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let key = target
            .strip_prefix(PRESIGN_PREFIX)
            .ok_or_else(|| StorageError::invalid_key(target, "not a presigned target"))?;
        self.store(key, data, progress);
        Ok(())
    }

    async fn presign_preview(
        &self,
        key: &str,
        _expires_in: Option<Duration>,
    ) -> Result<String, StorageError> {
        self.file_url(key).await
    }

    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        _content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        self.hit();
        self.store(path, data, &());
        Ok(())
    }

    async fn file_url(&self, key: &str) -> Result<String, StorageError> {
        self.hit();
        Ok(format!("https://fake.local/files/{key}?token=t"))
    }

    async fn get_bytes(&self, key: &str) -> Result<Bytes, StorageError> {
        self.hit();
        self.object(key).ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })
    }

    async fn get_content(&self, key: &str) -> Result<String, StorageError> {
        let bytes = self.get_bytes(key).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn delete(&self, key: &str) -> Result<DeleteOutcome, StorageError> {
        self.hit();
        Ok(match self.objects.lock().unwrap().remove(key) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::Missing,
        })
    }

    async fn delete_many(&self, keys: &[String]) -> Result<DeleteReport, StorageError> {
        delete_individually(keys, |key| async move { self.delete(&key).await }).await
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<ObjectInfo>, StorageError> {
        self.hit();
        let prefix = prefix.unwrap_or("");
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, data)| ObjectInfo {
                key: key.clone(),
                last_modified: None,
                size: data.len() as u64,
            })
            .collect())
    }

    fn as_resumable(&self) -> Option<&dyn ResumableUpload> {
        match self.kind {
            BackendKind::ManagedCloud => Some(self),
            BackendKind::ObjectStorage => None,
        }
    }
}

#[async_trait]
impl ResumableUpload for FakeBackend {
    async fn resumable_upload(
        &self,
        key: &str,
        data: Bytes,
        _content_type: &str,
        progress: &dyn TransferProgress,
    ) -> Result<String, StorageError> {
        self.hit();
        if let Some(err) = self.resumable_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.store(key, data, progress);
        Ok(format!("https://fake.local/download/{key}?token=t"))
    }
}

/// Factory handing out shared fake backends
pub struct FakeFactory {
    pub object_storage: Arc<FakeBackend>,
    pub managed_cloud: Arc<FakeBackend>,
    builds: AtomicUsize,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::with_backends(FakeBackend::object_storage(), FakeBackend::managed_cloud())
    }

    pub fn with_backends(object_storage: FakeBackend, managed_cloud: FakeBackend) -> Self {
        Self {
            object_storage: Arc::new(object_storage),
            managed_cloud: Arc::new(managed_cloud),
            builds: AtomicUsize::new(0),
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Remote calls across both backends
    pub fn total_calls(&self) -> usize {
        self.object_storage.calls() + self.managed_cloud.calls()
    }
}

#[async_trait]
impl BackendFactory for FakeFactory {
    async fn build(
        &self,
        kind: BackendKind,
        _config: &Config,
        _principal: &Principal,
    ) -> Result<Arc<dyn StorageBackend>, StorageError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let backend: Arc<dyn StorageBackend> = match kind {
            BackendKind::ObjectStorage => self.object_storage.clone(),
            BackendKind::ManagedCloud => self.managed_cloud.clone(),
        };
        Ok(backend)
    }
}

/// Mirror kept in memory, optionally failing every write
#[derive(Default)]
pub struct FakeMirror {
    entries: Mutex<HashMap<String, Bytes>>,
    fail_writes: bool,
}

impl FakeMirror {
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.lock().unwrap().contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[async_trait]
impl MirrorStore for FakeMirror {
    async fn put(&self, hash: &str, data: &Bytes) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::network("disk unavailable"));
        }
        self.entries
            .lock()
            .unwrap()
            .entry(hash.to_string())
            .or_insert_with(|| data.clone());
        Ok(())
    }

    async fn get(&self, hash: &str) -> Result<Option<Bytes>, StorageError> {
        Ok(self.entries.lock().unwrap().get(hash).cloned())
    }
}
