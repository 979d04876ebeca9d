// Router assembly for the segmentation API

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/segment", post(handlers::segment))
        .route("/status", get(handlers::health_check))
}

/// Full application: API routes, static files as fallback, CORS, access
/// logging and the upload size limit.
pub fn app(state: Arc<AppState>, static_dir: &Path, max_upload_bytes: usize) -> Router {
    Router::new()
        .merge(routes())
        .fallback_service(ServeDir::new(static_dir))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
