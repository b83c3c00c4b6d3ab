use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{admin, maintenance, AppState};
use crate::services::FederationNode;

/// Create the admin and node-to-node router
pub fn create_router(node: Arc<FederationNode>) -> Router {
    let state = AppState { node };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/tables", get(admin::list_tables))
        .route("/api/tables/{name}/sources", get(admin::list_sources))
        .route(
            "/api/tables/{name}/sources/{source}/refresh",
            post(admin::refresh_source),
        )
        .route("/api/refresh", post(admin::refresh))
        .route("/api/peers", post(admin::add_peer))
        .route("/api/peers/reload", post(admin::load_new_peers))
        .route("/api/peers/{id}", delete(admin::unload_peer))
        .route("/api/pools", get(admin::list_pools))
        .route("/api/maintain", post(maintenance::maintain))
        .route("/api/probe", post(maintenance::probe))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
