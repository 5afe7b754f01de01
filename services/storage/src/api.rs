use crate::backend::{BackendFactory, DeleteReport, ObjectInfo, Principal, StorageBackend};
use crate::config::ApiConfig;
use crate::coordinator::{DataUriUpload, EnvironmentSource, UploadCoordinator, UploadRequest};
use crate::error::{StorageError, UploadError};
use crate::progress::{FnObserver, UploadState, UploadStatus};
use crate::records::FileRecord;
use crate::selector::{select_backend, BackendAvailability, BackendKind};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument};

/// Header carrying the authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: UploadCoordinator,
    pub env: Arc<dyn EnvironmentSource>,
    pub factory: Arc<dyn BackendFactory>,
    /// Present when file records live in PostgreSQL
    pub db: Option<PgPool>,
}

/// Presign request
#[derive(Debug, Deserialize)]
pub struct PresignRequest {
    /// Object key relative to the caller's namespace
    pub pathname: String,
}

/// Presign response
#[derive(Debug, Serialize)]
pub struct PresignResponse {
    /// PUT URL (S3) or scoped object path (Firebase)
    pub url: String,
    pub backend: BackendKind,
}

/// Query parameters for previews
#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub key: String,
    /// Expiry in seconds for presigned previews
    pub expires_in: Option<u64>,
}

/// Preview response
#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub url: String,
}

/// Query parameters for content reads
#[derive(Debug, Deserialize)]
pub struct ContentQuery {
    /// Recorded location: object key, download URL or `mirror://` path
    pub key: String,
    /// Content hash used to fall back to the local mirror
    pub hash: Option<String>,
}

/// Query parameters for listing
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub prefix: Option<String>,
}

/// Listing response
#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub objects: Vec<ObjectInfo>,
}

/// Batch delete request
#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub keys: Vec<String>,
}

/// Query parameters for raw uploads
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub directory: Option<String>,
    pub knowledge_base_id: Option<String>,
    #[serde(default)]
    pub skip_file_type_check: bool,
}

/// Data URI upload request
#[derive(Debug, Deserialize)]
pub struct DataUriRequest {
    pub data_uri: String,
    pub filename: Option<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn storage_status(e: &StorageError) -> (StatusCode, &'static str) {
    match e {
        StorageError::Configuration(_) | StorageError::NotInitialized { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_NOT_CONFIGURED")
        }
        StorageError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        StorageError::Permission { .. } => (StatusCode::FORBIDDEN, "PERMISSION_DENIED"),
        StorageError::InvalidKey { .. } => (StatusCode::BAD_REQUEST, "INVALID_KEY"),
        StorageError::Network { .. } => (StatusCode::BAD_GATEWAY, "NETWORK_ERROR"),
        StorageError::RemoteRejection { .. } => (StatusCode::BAD_GATEWAY, "REMOTE_REJECTED"),
        StorageError::BatchDelete { .. } => (StatusCode::BAD_GATEWAY, "DELETE_FAILED"),
    }
}

fn storage_error(e: StorageError) -> ApiError {
    let (status, code) = storage_status(&e);
    if status.is_server_error() {
        error!(error = %e, "Storage operation failed");
    }
    api_error(status, e.to_string(), code)
}

fn upload_error(e: UploadError) -> ApiError {
    let (status, code) = match &e {
        UploadError::Storage(inner) => storage_status(inner),
        UploadError::UnsupportedFileType { .. } => {
            (StatusCode::UNSUPPORTED_MEDIA_TYPE, "UNSUPPORTED_FILE_TYPE")
        }
        UploadError::InvalidDataUri(_) => (StatusCode::BAD_REQUEST, "INVALID_DATA_URI"),
        UploadError::Records(_) => (StatusCode::INTERNAL_SERVER_ERROR, "RECORD_ERROR"),
        UploadError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
    };
    api_error(status, e.user_message(), code)
}

/// Caller identity from `x-user-id` and `authorization: Bearer`
pub fn principal_from_headers(headers: &HeaderMap) -> Principal {
    let uid = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from);
    let id_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from);
    Principal { uid, id_token }
}

/// Backend chosen by the selector for one request
async fn resolve_backend(
    state: &AppState,
    principal: &Principal,
) -> Result<Arc<dyn StorageBackend>, ApiError> {
    let config = state.env.snapshot().map_err(upload_error)?;
    let kind = select_backend(&BackendAvailability::from_config(&config)).map_err(storage_error)?;
    state
        .factory
        .build(kind, &config, principal)
        .await
        .map_err(storage_error)
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/upload/presign", post(presign_upload))
        .route("/api/v1/files/preview", get(preview_url))
        .route("/api/v1/files/content", get(file_content))
        .route("/api/v1/files", get(list_files).delete(delete_files))
        .route("/api/v1/files/data-uri", post(upload_data_uri))
        .route("/api/v1/files/:filename", put(upload_file))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "storage-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let Some(pool) = state.db.as_ref() else {
        return (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "not_configured"
            })),
        );
    };

    match sqlx::query("SELECT 1").fetch_one(pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Create an upload target for the selected backend
#[instrument(skip(state, headers))]
async fn presign_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PresignRequest>,
) -> Result<Json<PresignResponse>, ApiError> {
    let principal = principal_from_headers(&headers);
    let backend = resolve_backend(&state, &principal).await?;

    let url = backend
        .presign_upload(&request.pathname)
        .await
        .map_err(storage_error)?;

    Ok(Json(PresignResponse {
        url,
        backend: backend.kind(),
    }))
}

/// Readable URL for a stored object
#[instrument(skip(state, headers))]
async fn preview_url(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<PreviewQuery>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let principal = principal_from_headers(&headers);
    let backend = resolve_backend(&state, &principal).await?;

    let url = backend
        .presign_preview(&params.key, params.expires_in.map(Duration::from_secs))
        .await
        .map_err(storage_error)?;

    Ok(Json(PreviewResponse { url }))
}

/// Stored bytes for a recorded location
#[instrument(skip(state, headers))]
async fn file_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ContentQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers);
    let bytes = state
        .coordinator
        .read_content(&params.key, params.hash.as_deref(), &principal)
        .await
        .map_err(upload_error)?;

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

/// List stored objects
#[instrument(skip(state, headers))]
async fn list_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let principal = principal_from_headers(&headers);
    let backend = resolve_backend(&state, &principal).await?;

    let objects = backend
        .list(params.prefix.as_deref())
        .await
        .map_err(storage_error)?;

    Ok(Json(ListResponse { objects }))
}

/// Delete a batch of objects
#[instrument(skip(state, headers, request), fields(count = request.keys.len()))]
async fn delete_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<DeleteReport>, ApiError> {
    if request.keys.len() > 1000 {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Maximum 1000 keys per batch",
            "BATCH_TOO_LARGE",
        ));
    }

    let principal = principal_from_headers(&headers);
    let backend = resolve_backend(&state, &principal).await?;

    let report = backend
        .delete_many(&request.keys)
        .await
        .map_err(storage_error)?;

    Ok(Json(report))
}

/// Upload a raw request body through the coordinator
#[instrument(skip(state, headers, params, body), fields(size_bytes = body.len()))]
async fn upload_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    headers: HeaderMap,
    Query(params): Query<UploadQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<FileRecord>), ApiError> {
    let principal = principal_from_headers(&headers);
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");

    let mut request = UploadRequest::new(filename, mime_type, body);
    request.directory = params.directory;
    request.knowledge_base_id = params.knowledge_base_id;
    request.skip_file_type_check = params.skip_file_type_check;

    let observer = FnObserver::new(|status: UploadStatus, state: &UploadState| {
        debug!(?status, progress = state.progress, speed = state.speed, "Upload progress");
    });

    let record = state
        .coordinator
        .upload_with_retry(&request, &principal, &observer)
        .await
        .map_err(upload_error)?;

    Ok((StatusCode::CREATED, Json(record)))
}

/// Upload an image supplied as a base64 data URI
#[instrument(skip(state, headers, request))]
async fn upload_data_uri(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DataUriRequest>,
) -> Result<(StatusCode, Json<DataUriUpload>), ApiError> {
    let principal = principal_from_headers(&headers);
    let observer = FnObserver::new(|status: UploadStatus, state: &UploadState| {
        debug!(?status, progress = state.progress, "Data URI upload progress");
    });

    let upload = state
        .coordinator
        .upload_data_uri(
            &request.data_uri,
            request.filename.as_deref(),
            &principal,
            &observer,
        )
        .await
        .map_err(upload_error)?;

    Ok((StatusCode::CREATED, Json(upload)))
}

/// Start the storage API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting storage API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RuntimeKind};
    use crate::coordinator::StaticEnvironment;
    use crate::records::MemoryFileRecords;
    use crate::testing::{FakeFactory, FakeMirror};

    fn state(config: Config) -> (AppState, Arc<FakeFactory>) {
        let env: Arc<dyn EnvironmentSource> = Arc::new(StaticEnvironment(config));
        let factory = Arc::new(FakeFactory::new());
        let coordinator = UploadCoordinator::new(
            env.clone(),
            factory.clone(),
            Arc::new(MemoryFileRecords::new()),
            Arc::new(FakeMirror::default()),
        );
        (
            AppState {
                coordinator,
                env,
                factory: factory.clone(),
                db: None,
            },
            factory,
        )
    }

    fn s3_config() -> Config {
        let mut config = Config::default();
        config.s3.access_key_id = Some("AKIA".into());
        config.s3.secret_access_key = Some("secret".into());
        config.s3.bucket = Some("uploads".into());
        config
    }

    #[test]
    fn test_principal_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(principal_from_headers(&headers), Principal::anonymous());

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("u1"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        let principal = principal_from_headers(&headers);
        assert_eq!(principal.uid.as_deref(), Some("u1"));
        assert_eq!(principal.id_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_error_status_mapping() {
        let (status, body) = storage_error(StorageError::NotFound { key: "k".into() });
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.code, "NOT_FOUND");

        let (status, _) = storage_error(StorageError::invalid_key("../x", "escapes"));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = upload_error(UploadError::UnsupportedFileType {
            extension: "pdf".into(),
        });
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(body.error.contains(".pdf"));
    }

    #[tokio::test]
    async fn test_presign_uses_selected_backend() {
        let (state, factory) = state(s3_config());

        let Json(response) = presign_upload(
            State(state),
            HeaderMap::new(),
            Json(PresignRequest {
                pathname: "files/a.png".into(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.backend, BackendKind::ObjectStorage);
        assert!(response.url.ends_with("files/a.png"));
        assert_eq!(factory.object_storage.calls(), 1);
    }

    #[tokio::test]
    async fn test_presign_in_restricted_runtime_without_s3() {
        let mut config = Config::default();
        config.service.runtime = RuntimeKind::Edge;
        let (state, factory) = state(config);

        let (status, body) = presign_upload(
            State(state),
            HeaderMap::new(),
            Json(PresignRequest {
                pathname: "files/a.png".into(),
            }),
        )
        .await
        .unwrap_err();

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.code, "STORAGE_NOT_CONFIGURED");
        assert_eq!(factory.builds(), 0);
    }

    #[tokio::test]
    async fn test_delete_reports_missing_keys() {
        let (state, factory) = state(s3_config());
        factory.object_storage.insert("k1", b"1");
        factory.object_storage.insert("k3", b"3");

        let Json(report) = delete_files(
            State(state),
            HeaderMap::new(),
            Json(DeleteRequest {
                keys: vec!["k1".into(), "k2".into(), "k3".into()],
            }),
        )
        .await
        .unwrap();

        assert_eq!(report.deleted, vec!["k1".to_string(), "k3".to_string()]);
        assert_eq!(report.missing, vec!["k2".to_string()]);
        assert_eq!(factory.object_storage.object_count(), 0);
    }

    #[tokio::test]
    async fn test_content_serves_mirrored_upload() {
        let (state, _) = state(Config::default());
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));

        let (_, Json(record)) = upload_file(
            State(state.clone()),
            Path("a.png".to_string()),
            headers,
            Query(UploadQuery {
                directory: None,
                knowledge_base_id: None,
                skip_file_type_check: false,
            }),
            Bytes::from_static(b"\x89PNG"),
        )
        .await
        .unwrap();

        let response = file_content(
            State(state.clone()),
            HeaderMap::new(),
            Query(ContentQuery {
                key: record.url.clone(),
                hash: None,
            }),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, Bytes::from_static(b"\x89PNG"));

        let (status, body) = file_content(
            State(state),
            HeaderMap::new(),
            Query(ContentQuery {
                key: "mirror://0000".into(),
                hash: None,
            }),
        )
        .await
        .map(|_| ())
        .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.code, "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_upload_file_creates_record() {
        let (state, _) = state(s3_config());
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let (status, Json(record)) = upload_file(
            State(state),
            Path("note.txt".to_string()),
            headers,
            Query(UploadQuery {
                directory: Some("docs".into()),
                knowledge_base_id: None,
                skip_file_type_check: false,
            }),
            Bytes::from_static(b"0123456789"),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(record.name, "note.txt");
        assert_eq!(record.file_type, "text/plain");
        assert!(record.url.starts_with("docs/"));
    }
}
