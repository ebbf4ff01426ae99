//! Share Routes
//!
//! Sender-side API for creating shares, uploading chunks and managing the
//! share lifecycle.
//!
//! Endpoints:
//! - POST /api/v1/shares - Create a share, returns its token
//! - GET /api/v1/shares - List shares, newest first
//! - GET /api/v1/shares/:token - Share status
//! - DELETE /api/v1/shares/:token - Delete share and files
//! - PUT /api/v1/shares/:token/files/:file_id/chunks/:index - Upload a chunk
//! - GET /api/v1/shares/:token/names - Preview the stored name for a file
//! - POST /api/v1/shares/:token/finalize - Seal the share and notify
//! - POST /api/v1/shares/:token/reactivate - Extend an expired share
//! - POST /api/v1/shares/:token/notify - Resend the recipient notification

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::share::{
    ChunkReceipt, ChunkUpload, FinalizeResult, SharePage, ShareState, ShareStatus, MAX_RETENTION_HOURS,
};
use crate::state::AppState;

/// Headroom above the chunk limit so oversized chunks get a JSON error
const BODY_LIMIT_SLACK: u64 = 64 * 1024;

// ============================================================================
// Router
// ============================================================================

/// Create the shares router
pub fn router(max_chunk_size: u64) -> Router<AppState> {
    let body_limit = (max_chunk_size + BODY_LIMIT_SLACK) as usize;

    Router::new()
        .route("/", post(create_share).get(list_shares))
        .route("/:token", get(get_share).delete(delete_share))
        .route(
            "/:token/files/:file_id/chunks/:index",
            put(upload_chunk).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/:token/names", get(preview_name))
        .route("/:token/finalize", post(finalize_share))
        .route("/:token/reactivate", post(reactivate_share))
        .route("/:token/notify", post(notify_recipient))
}

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShareRequest {
    #[serde(default)]
    pub recipient_email: String,
    pub retention_hours: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateShareResponse {
    pub token: String,
    pub state: ShareState,
    pub expires_at: DateTime<Utc>,
    pub download_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    /// Total chunks of the file
    pub total: u32,
    /// Original file name
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct NameQuery {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamePreview {
    pub original_name: String,
    pub stored_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactivateRequest {
    pub expires_at: Option<DateTime<Utc>>,
    pub retention_hours: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    pub recipient_email: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/shares
async fn create_share(
    State(state): State<AppState>,
    Json(request): Json<CreateShareRequest>,
) -> Result<(StatusCode, Json<CreateShareResponse>)> {
    let registry = state.registry();
    let retention = request
        .retention_hours
        .unwrap_or(registry.config().default_retention_hours);

    let token = registry.create(&request.recipient_email, retention).await?;
    let share = registry.lookup(&token).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateShareResponse {
            download_url: registry.config().download_url(&token),
            token,
            state: share.state,
            expires_at: share.expires_at,
        }),
    ))
}

/// GET /api/v1/shares
async fn list_shares(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<SharePage> {
    let page = state
        .registry()
        .list(query.page.unwrap_or(1), query.per_page.unwrap_or(20))
        .await;
    Json(page)
}

/// GET /api/v1/shares/:token
async fn get_share(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<ShareStatus>> {
    Ok(Json(state.registry().status(&token).await?))
}

/// DELETE /api/v1/shares/:token
async fn delete_share(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<StatusCode> {
    state.registry().delete(&token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/v1/shares/:token/files/:file_id/chunks/:index?total=N&name=...
///
/// The chunk data is the raw request body.
async fn upload_chunk(
    State(state): State<AppState>,
    Path((token, file_id, index)): Path<(String, String, u32)>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> Result<Json<ChunkReceipt>> {
    let receipt = state
        .assembler()
        .receive_chunk(
            &token,
            ChunkUpload {
                file_id,
                chunk_index: index,
                total_chunks: query.total,
                original_name: query.name,
                payload: body.to_vec(),
            },
        )
        .await?;

    Ok(Json(receipt))
}

/// GET /api/v1/shares/:token/names?name=...
async fn preview_name(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<NameQuery>,
) -> Result<Json<NamePreview>> {
    let stored_name = state.registry().resolve_name(&token, &query.name).await?;
    Ok(Json(NamePreview {
        original_name: query.name,
        stored_name,
    }))
}

/// POST /api/v1/shares/:token/finalize
async fn finalize_share(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<FinalizeResult>> {
    Ok(Json(state.registry().finalize(&token).await?))
}

/// POST /api/v1/shares/:token/reactivate
///
/// Takes either an absolute `expiresAt` or `retentionHours` from now;
/// an empty body applies the default retention.
async fn reactivate_share(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: Option<Json<ReactivateRequest>>,
) -> Result<Json<ShareStatus>> {
    let registry = state.registry();
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let expires_at = match (request.expires_at, request.retention_hours) {
        (Some(_), Some(_)) => {
            return Err(AppError::BadRequest(
                "give either expiresAt or retentionHours, not both".into(),
            ))
        }
        (Some(at), None) => at,
        (None, hours) => {
            let hours = hours.unwrap_or(registry.config().default_retention_hours);
            if !(1..=MAX_RETENTION_HOURS).contains(&hours) {
                return Err(AppError::BadRequest(format!(
                    "retentionHours must be 1 to {}",
                    MAX_RETENTION_HOURS
                )));
            }
            registry.now() + Duration::hours(hours)
        }
    };

    let share = registry.reactivate(&token, expires_at).await?;
    Ok(Json(ShareStatus::from(&share)))
}

/// POST /api/v1/shares/:token/notify
async fn notify_recipient(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: Option<Json<NotifyRequest>>,
) -> Result<Json<ShareStatus>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let status = state
        .registry()
        .renotify(&token, request.recipient_email.as_deref())
        .await?;
    Ok(Json(status))
}
