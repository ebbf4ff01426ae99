//! Error types for the Tokenshare server

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::share::{IncompleteFile, ShareError};

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Share(#[from] ShareError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    incomplete_files: Option<Vec<IncompleteFile>>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, incomplete_files) = match &self {
            AppError::Share(e) => {
                let incomplete = match e {
                    ShareError::IncompleteUpload(files) => Some(files.clone()),
                    _ => None,
                };
                if matches!(e, ShareError::Persistence(_)) {
                    tracing::error!("Persistence error: {}", e);
                }
                (e.status_code(), e.code(), incomplete)
            }
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", None),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", None)
            }
        };

        let retryable = matches!(&self, AppError::Share(e) if e.is_retryable());

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code,
            incomplete_files,
        });

        if retryable {
            return (status, [(header::RETRY_AFTER, "1")], body).into_response();
        }
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_errors_keep_their_status() {
        let response = AppError::from(ShareError::NotAvailable("expired".into())).into_response();
        assert_eq!(response.status(), StatusCode::GONE);

        let response = AppError::from(ShareError::StorageIo("timeout".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }
}
