use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the storage service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3-compatible object storage configuration
    #[serde(default)]
    pub s3: S3Config,
    /// Firebase Storage configuration
    #[serde(default)]
    pub firebase: FirebaseConfig,
    /// Local mirror configuration
    #[serde(default)]
    pub mirror: MirrorConfig,
    /// Upload pipeline configuration
    #[serde(default)]
    pub upload: UploadConfig,
    /// Database configuration for file records
    #[serde(default)]
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Runtime the service is hosted in
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Full runtime, every backend client is usable
    #[default]
    Full,
    /// Restricted edge runtime that cannot host the Firebase client
    Edge,
}

/// Deployment mode; non-image uploads to the local mirror need `Full`
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    #[default]
    Full,
    Client,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Hosting runtime
    #[serde(default)]
    pub runtime: RuntimeKind,
    /// Deployment mode
    #[serde(default)]
    pub deployment_mode: DeploymentMode,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Access key id
    pub access_key_id: Option<String>,
    /// Secret access key
    pub secret_access_key: Option<String>,
    /// Bucket name
    pub bucket: Option<String>,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, R2, etc.)
    pub endpoint_url: Option<String>,
    /// Public domain serving the bucket
    pub public_domain: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Bucket objects are publicly readable, previews need no signing
    #[serde(default)]
    pub set_acl: bool,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
}

/// Firebase Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FirebaseConfig {
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    pub storage_bucket: Option<String>,
    /// REST endpoint, overridable for the emulator
    #[serde(default = "default_firebase_endpoint")]
    pub endpoint: String,
}

/// Local mirror configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    /// Write-through after remote uploads
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Root directory of the content-addressed store
    #[serde(default = "default_mirror_root")]
    pub root: PathBuf,
}

/// Upload pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Default directory for object-storage uploads
    #[serde(default = "default_file_path")]
    pub file_path: String,
    /// Chunk size for resumable uploads and streamed PUT bodies
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,
    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Total time budget for retrying network failures
    #[serde(default = "default_max_retry_elapsed_secs")]
    pub max_retry_elapsed_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL, records are kept in memory when absent
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Largest accepted request body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "dropline-storage".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_firebase_endpoint() -> String {
    "https://firebasestorage.googleapis.com".to_string()
}

fn default_mirror_root() -> PathBuf {
    PathBuf::from("data/mirror")
}

fn default_file_path() -> String {
    "files".to_string()
}

fn default_chunk_size() -> usize {
    256 * 1024 * 4 // 1MiB, a multiple of the 256KiB resumable granularity
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_retry_elapsed_secs() -> u64 {
    30
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    100 * 1024 * 1024
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "dropline-storage")?
            .set_default("service.log_level", "info")?
            .add_source(config::File::with_name("config/storage").required(false))
            .add_source(config::File::with_name("/etc/dropline/storage").required(false))
            // DROPLINE__S3__ACCESS_KEY_ID -> s3.access_key_id
            .add_source(
                config::Environment::with_prefix("DROPLINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get HTTP request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.upload.request_timeout_secs)
    }
}

impl S3Config {
    /// Access key, secret and bucket are all present and non-empty
    pub fn is_configured(&self) -> bool {
        [&self.access_key_id, &self.secret_access_key, &self.bucket]
            .iter()
            .all(|v| is_present(v))
    }
}

impl FirebaseConfig {
    /// API key, project id and storage bucket are all present and non-empty
    pub fn is_configured(&self) -> bool {
        [&self.api_key, &self.project_id, &self.storage_bucket]
            .iter()
            .all(|v| is_present(v))
    }
}

fn is_present(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            s3: S3Config::default(),
            firebase: FirebaseConfig::default(),
            mirror: MirrorConfig::default(),
            upload: UploadConfig::default(),
            database: DatabaseConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
            runtime: RuntimeKind::default(),
            deployment_mode: DeploymentMode::default(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            access_key_id: None,
            secret_access_key: None,
            bucket: None,
            region: default_region(),
            endpoint_url: None,
            public_domain: None,
            force_path_style: false,
            set_acl: false,
            presigned_url_expiry_secs: default_presigned_url_expiry_secs(),
        }
    }
}

impl Default for FirebaseConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            project_id: None,
            storage_bucket: None,
            endpoint: default_firebase_endpoint(),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            root: default_mirror_root(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            file_path: default_file_path(),
            chunk_size_bytes: default_chunk_size(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retry_elapsed_secs: default_max_retry_elapsed_secs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: default_true(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}
