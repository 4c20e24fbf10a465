//! REST API routes

use crate::catalog::{CatalogEntry, CatalogLanguage, CatalogQuery};
use crate::content_server::SupervisorStatus;
use crate::db::{ActivityEntry, Archive, ArchiveFilter, UpdateSettings};
use crate::disk::DiskSpace;
use crate::download::InFlightDownload;
use crate::error::LibraryError;
use crate::library::{BulkCheckEntry, DownloadMetadata, MetadataUpdate, UpdateCheckResult};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

const DEFAULT_ACTIVITY_LIMIT: usize = 50;
const MAX_ACTIVITY_LIMIT: usize = 500;

/// Create API routes
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Archives
        .route("/archives", get(list_archives))
        .route("/archives/check", post(check_all_archives))
        .route(
            "/archives/{id}",
            get(get_archive).patch(update_archive).delete(delete_archive),
        )
        .route("/archives/{id}/check", post(check_archive))
        .route("/archives/{id}/update", post(apply_update))
        .route("/archives/{id}/auto-update", put(set_auto_update))
        .route("/archives/{id}/reactivate", post(reactivate_archive))
        // Downloads
        .route("/downloads", post(add_download))
        .route("/downloads/progress", get(download_progress))
        // Catalog
        .route("/catalog", get(browse_catalog))
        .route("/catalog/languages", get(catalog_languages))
        // Settings and status
        .route(
            "/update-settings",
            get(get_update_settings).put(save_update_settings),
        )
        .route("/activity", get(list_activity))
        .route("/content-server", get(content_server_status))
        .route("/content-server/restart", post(restart_content_server))
        .route("/storage", get(storage))
}

// ============ Archive Endpoints ============

async fn list_archives(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ArchiveFilter>,
) -> Result<Json<Vec<Archive>>, AppError> {
    Ok(Json(state.library.list_archives(filter)?))
}

async fn get_archive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Archive>, AppError> {
    Ok(Json(state.library.get_archive(id)?))
}

async fn update_archive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<MetadataUpdate>,
) -> Result<Json<Archive>, AppError> {
    Ok(Json(state.library.update_metadata(id, req)?))
}

async fn delete_archive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.library.delete_archive(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn check_archive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<UpdateCheckResult>, AppError> {
    Ok(Json(state.library.check_for_update(id).await?))
}

async fn check_all_archives(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<BulkCheckEntry>>, AppError> {
    Ok(Json(state.library.check_all_for_updates().await?))
}

/// Response for requests that start a background transfer
#[derive(Debug, Serialize)]
pub struct StartedResponse {
    pub filename: String,
}

async fn apply_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let filename = state.library.apply_update(id)?;
    info!("Update of archive {} started: {}", id, filename);
    Ok((StatusCode::ACCEPTED, Json(StartedResponse { filename })))
}

#[derive(Debug, Deserialize)]
pub struct AutoUpdateRequest {
    pub enabled: bool,
}

async fn set_auto_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<AutoUpdateRequest>,
) -> Result<Json<Archive>, AppError> {
    state.library.set_auto_update(id, req.enabled)?;
    Ok(Json(state.library.get_archive(id)?))
}

async fn reactivate_archive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Archive>, AppError> {
    Ok(Json(state.library.reactivate(id)?))
}

// ============ Download Endpoints ============

/// Request to add a new archive download
#[derive(Debug, Deserialize)]
pub struct AddDownloadRequest {
    pub url: String,
    #[serde(flatten)]
    pub metadata: DownloadMetadata,
}

async fn add_download(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddDownloadRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.url.trim().is_empty() {
        return Err(AppError::BadRequest("url is required".into()));
    }

    let filename = state.library.download_new(&req.url, req.metadata).await?;
    Ok((StatusCode::ACCEPTED, Json(StartedResponse { filename })))
}

async fn download_progress(State(state): State<Arc<AppState>>) -> Json<Vec<InFlightDownload>> {
    Json(state.library.download_progress())
}

// ============ Catalog Endpoints ============

async fn browse_catalog(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<Vec<CatalogEntry>>, AppError> {
    Ok(Json(state.library.browse_catalog(&query).await?))
}

async fn catalog_languages(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CatalogLanguage>>, AppError> {
    Ok(Json(state.library.catalog_languages().await?))
}

// ============ Settings & Status Endpoints ============

async fn get_update_settings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<UpdateSettings>, AppError> {
    Ok(Json(state.library.update_settings()?))
}

async fn save_update_settings(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<UpdateSettings>,
) -> Result<Json<UpdateSettings>, AppError> {
    let saved = state.library.save_update_settings(&settings)?;
    info!("Update settings saved");
    Ok(Json(saved))
}

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<usize>,
}

async fn list_activity(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Vec<ActivityEntry>>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
        .clamp(1, MAX_ACTIVITY_LIMIT);
    Ok(Json(state.library.list_activity(limit)?))
}

async fn content_server_status(State(state): State<Arc<AppState>>) -> Json<SupervisorStatus> {
    Json(state.library.content_server_status())
}

async fn restart_content_server(State(state): State<Arc<AppState>>) -> StatusCode {
    state.library.restart_content_server();
    StatusCode::ACCEPTED
}

async fn storage(State(state): State<Arc<AppState>>) -> Result<Json<DiskSpace>, AppError> {
    Ok(Json(state.library.disk_space()?))
}

// ============ Error Handling ============

/// API error type
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    InsufficientStorage(String),
    BadGateway(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::InsufficientStorage(msg) => (StatusCode::INSUFFICIENT_STORAGE, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        let body = Json(serde_json::json!({ "error": message }));
        (status, body).into_response()
    }
}

impl From<LibraryError> for AppError {
    fn from(err: LibraryError) -> Self {
        let message = err.to_string();
        match err {
            LibraryError::NotFound(_) => AppError::NotFound(message),
            LibraryError::AlreadyExists(_) | LibraryError::AlreadyDownloading(_) => {
                AppError::Conflict(message)
            }
            LibraryError::NoUpdateAvailable
            | LibraryError::NotQuarantined(_)
            | LibraryError::InvalidRequest(_) => AppError::BadRequest(message),
            LibraryError::InsufficientDiskSpace { .. } => AppError::InsufficientStorage(message),
            LibraryError::CatalogUnavailable(_) | LibraryError::UpstreamUnavailable(_) => {
                AppError::BadGateway(message)
            }
            LibraryError::DownloadCorrupt { .. }
            | LibraryError::UpdateFinalization(_)
            | LibraryError::Transfer(_)
            | LibraryError::Io(_)
            | LibraryError::Internal(_) => {
                error!("Request failed: {}", message);
                AppError::Internal(message)
            }
        }
    }
}
