//! Route modules for Tokenshare Server

pub mod downloads;
pub mod health;
pub mod maintenance;
pub mod shares;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full application router
pub fn app(state: AppState) -> Router {
    let max_chunk_size = state.registry().config().max_chunk_size;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(health::router())
        .nest("/api/v1/shares", shares::router(max_chunk_size))
        .nest("/api/v1/maintenance", maintenance::router())
        .nest("/download", downloads::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
