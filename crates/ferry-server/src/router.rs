use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use ferry_forward::FORWARD_PATH;
use tower_http::trace::TraceLayer;

use crate::handler::{self, AppState};

/// Build the router with every ferry endpoint.
pub fn build_router(state: AppState, max_request_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(handler::health_handler))
        .route(FORWARD_PATH, post(handler::forward_handler))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
