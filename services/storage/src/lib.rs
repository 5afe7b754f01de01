//! Dropline Storage Service
//!
//! File upload pipeline in front of two remote storage backends: S3-compatible
//! object storage and Firebase Storage. Uploads are deduplicated by content
//! hash, routed through a fallback chain of upload strategies, mirrored into a
//! local content-addressed store and registered as file records.
//!
//! ## Features
//!
//! - **Backend Selection**: Object storage is preferred; the restricted edge
//!   runtime only supports object storage
//! - **Upload Strategies**: Direct resumable uploads to Firebase, falling back
//!   to presign-then-PUT on the selected backend
//! - **Deduplication**: A known SHA-256 digest short-circuits the transfer
//! - **Local Mirror**: Content-addressed write-through store, used as the
//!   only storage when no remote backend is configured
//! - **Progress Reporting**: Observers and event streams for every upload
//!
//! ## Architecture
//!
//! ```text
//!   bytes ──▶ Hasher ──▶ FileRecordService ── known hash ──▶ new record
//!                              │
//!                              ▼ unknown
//!                       BackendSelector
//!                              │
//!        ┌─────────────────────┼──────────────────────┐
//!        ▼                     ▼                      ▼
//! ┌──────────────┐     ┌──────────────┐       ┌──────────────┐
//! │ Direct       │────▶│ Presign then │       │ Local mirror │
//! │ resumable    │fail │ PUT          │       │ only         │
//! └──────────────┘     └──────────────┘       └──────────────┘
//!        │                     │                      │
//!        └────────── mirror write-through ────────────┤
//!                                                     ▼
//!                                              file record
//! ```

pub mod api;
pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hasher;
pub mod mirror;
pub mod orchestrator;
pub mod progress;
pub mod records;
pub mod selector;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BackendFactory, DefaultBackendFactory, Principal, StorageBackend};
pub use config::Config;
pub use coordinator::{UploadCoordinator, UploadRequest};
pub use error::{StorageError, UploadError};
pub use hasher::hash_bytes;
pub use mirror::{FsMirror, MirrorStore};
pub use progress::{UploadEvent, UploadState, UploadStatus};
pub use records::{FileMetadata, FileRecord, FileRecordService, PgFileRecords};
pub use selector::{select_backend, BackendAvailability, BackendKind};
