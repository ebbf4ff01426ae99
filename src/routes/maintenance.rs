//! Maintenance routes

use axum::{extract::State, routing::post, Json, Router};

use crate::share::SweepReport;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/cleanup", post(run_cleanup))
}

/// POST /api/v1/maintenance/cleanup
///
/// Run one reaper sweep now and report what it did.
async fn run_cleanup(State(state): State<AppState>) -> Json<SweepReport> {
    tracing::info!("Manual cleanup requested");
    Json(state.reaper().sweep().await)
}
