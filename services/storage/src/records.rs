use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Where and how an upload's bytes are stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// SHA-256 hex digest of the content
    pub content_hash: String,
    /// Object key, download URL or `mirror://{hash}`
    pub storage_path: String,
    pub dirname: String,
    /// Generated name the bytes are stored under
    pub filename: String,
    /// Name supplied by the uploader
    pub original_filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// Whole hours since the Unix epoch
    pub created_at_bucket: i64,
}

/// Record to register after a successful upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFileRecord {
    pub file_type: String,
    pub hash: String,
    pub metadata: FileMetadata,
    pub name: String,
    pub size: u64,
    pub url: String,
    pub knowledge_base_id: Option<String>,
}

/// Stored file record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: Uuid,
    pub url: String,
    pub name: String,
    pub hash: String,
    pub size: u64,
    pub file_type: String,
    pub metadata: FileMetadata,
    pub created_at: DateTime<Utc>,
}

/// Answer to a hash lookup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashCheck {
    pub is_exist: bool,
    pub metadata: Option<FileMetadata>,
}

impl HashCheck {
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn found(metadata: FileMetadata) -> Self {
        Self {
            is_exist: true,
            metadata: Some(metadata),
        }
    }
}

/// External service that owns file records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileRecordService: Send + Sync {
    /// Look up earlier uploads of the same content
    async fn check_file_hash(&self, hash: &str) -> Result<HashCheck>;

    async fn create_file(&self, record: NewFileRecord) -> Result<FileRecord>;
}

#[derive(Debug, FromRow)]
struct FileRow {
    id: Uuid,
    url: String,
    name: String,
    hash: String,
    size: i64,
    file_type: String,
    metadata: Json<FileMetadata>,
    created_at: DateTime<Utc>,
}

impl From<FileRow> for FileRecord {
    fn from(row: FileRow) -> Self {
        Self {
            id: row.id,
            url: row.url,
            name: row.name,
            hash: row.hash,
            size: row.size.max(0) as u64,
            file_type: row.file_type,
            metadata: row.metadata.0,
            created_at: row.created_at,
        }
    }
}

/// File records in PostgreSQL
pub struct PgFileRecords {
    pool: PgPool,
}

impl PgFileRecords {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .context("database.url is not configured")?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the database pool for health checks
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl FileRecordService for PgFileRecords {
    #[instrument(skip(self))]
    async fn check_file_hash(&self, hash: &str) -> Result<HashCheck> {
        let row: Option<(Json<FileMetadata>,)> = sqlx::query_as(
            r#"
            SELECT metadata
            FROM files
            WHERE hash = $1
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to check file hash")?;

        Ok(match row {
            Some((Json(metadata),)) => HashCheck::found(metadata),
            None => HashCheck::missing(),
        })
    }

    #[instrument(skip(self, record), fields(hash = %record.hash, name = %record.name))]
    async fn create_file(&self, record: NewFileRecord) -> Result<FileRecord> {
        let row = sqlx::query_as::<_, FileRow>(
            r#"
            INSERT INTO files (
                id, url, name, hash, size, file_type,
                metadata, knowledge_base_id, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, NOW()
            )
            RETURNING id, url, name, hash, size, file_type, metadata, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&record.url)
        .bind(&record.name)
        .bind(&record.hash)
        .bind(i64::try_from(record.size).context("file size exceeds BIGINT")?)
        .bind(&record.file_type)
        .bind(Json(&record.metadata))
        .bind(&record.knowledge_base_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert file record")?;

        debug!(id = %row.id, "Created file record");
        Ok(row.into())
    }
}

/// Process-local records, used when no database is configured
#[derive(Default)]
pub struct MemoryFileRecords {
    records: RwLock<Vec<FileRecord>>,
}

impl MemoryFileRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl FileRecordService for MemoryFileRecords {
    async fn check_file_hash(&self, hash: &str) -> Result<HashCheck> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .find(|r| r.hash == hash)
            .map(|r| HashCheck::found(r.metadata.clone()))
            .unwrap_or_default())
    }

    async fn create_file(&self, record: NewFileRecord) -> Result<FileRecord> {
        let created = FileRecord {
            id: Uuid::new_v4(),
            url: record.url,
            name: record.name,
            hash: record.hash,
            size: record.size,
            file_type: record.file_type,
            metadata: record.metadata,
            created_at: Utc::now(),
        };
        self.records.write().await.push(created.clone());
        Ok(created)
    }
}
