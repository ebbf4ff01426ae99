//! Download routes
//!
//! Recipient-side endpoints. Only Active shares are served; everything else
//! answers 410 Gone.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::share::{FileStatus, ShareError, ShareState};
use crate::state::AppState;

/// Create the downloads router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:token", get(list_files))
        .route("/:token/zip", get(download_bundle))
        .route("/:token/files/:file_id", get(download_file))
}

/// What a recipient sees for a share
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadListing {
    pub expires_at: DateTime<Utc>,
    pub total_bytes: u64,
    pub files: Vec<FileStatus>,
}

/// GET /download/:token
async fn list_files(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<DownloadListing>> {
    let share = state.registry().lookup(&token).await?;
    if share.state != ShareState::Active {
        return Err(ShareError::NotAvailable(format!("share is {}", share.state)).into());
    }

    Ok(Json(DownloadListing {
        expires_at: share.expires_at,
        total_bytes: share.total_size(),
        files: share.files.iter().map(FileStatus::from).collect(),
    }))
}

/// GET /download/:token/files/:file_id
async fn download_file(
    State(state): State<AppState>,
    Path((token, file_id)): Path<(String, String)>,
) -> Result<Response> {
    let file = state.downloads().open_file(&token, &file_id).await?;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, file.content_type)
        .header(header::CONTENT_LENGTH, file.bytes.len())
        .header(header::CONTENT_DISPOSITION, attachment(&file.stored_name))
        .header(header::CACHE_CONTROL, "no-store");
    if let Some(sha256) = &file.sha256 {
        builder = builder.header("X-Content-SHA256", sha256.as_str());
    }

    builder
        .body(Body::from(file.bytes))
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// GET /download/:token/zip
async fn download_bundle(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response> {
    let bundle = state.downloads().open_bundle(&token).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(header::CONTENT_LENGTH, bundle.bytes.len())
        .header(header::CONTENT_DISPOSITION, attachment(&bundle.filename))
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from(bundle.bytes))
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// Content-Disposition with an ASCII fallback and an RFC 5987 UTF-8 name
fn attachment(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .map(|c| if c == '"' || c == '\\' { '_' } else { c })
        .collect();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(filename)
    )
}
