use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use super::AppState;
use crate::api::middleware::AppError;
use crate::models::{EndpointDescriptor, PeerConnection};

#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    /// Tables to check; all tables when absent
    #[serde(default)]
    pub tables: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct AddPeerRequest {
    pub id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    pub endpoint: EndpointDescriptor,
    /// This node maintains the connection
    #[serde(default = "default_outgoing")]
    pub outgoing: bool,
}

fn default_outgoing() -> bool {
    true
}

/// List loaded logical tables
pub async fn list_tables(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "tables": state.node.table_statuses()
    }))
}

/// List the data sources behind a logical table, in array order
pub async fn list_sources(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let sources = state
        .node
        .data_source_statuses(&name)
        .ok_or_else(|| AppError::NotFound(format!("Logical table {} is not loaded", name)))?;

    Ok(Json(serde_json::json!({
        "table": name,
        "sources": sources
    })))
}

/// Refresh all tables, or those listed in the body
pub async fn refresh(State(state): State<AppState>, body: Bytes) -> Result<Json<serde_json::Value>, AppError> {
    let request: RefreshRequest = if body.is_empty() {
        RefreshRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::Validation(format!("Invalid refresh request: {}", e)))?
    };

    let report = state.node.refresh(request.tables.as_deref()).await?;
    Ok(Json(serde_json::json!({
        "report": report
    })))
}

/// Reload a single local data source
pub async fn refresh_source(
    State(state): State<AppState>,
    Path((table, source)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = state.node.refresh_data_source(&table, &source).await?;
    Ok(Json(serde_json::json!({
        "source": status
    })))
}

/// Federate with a peer found by discovery
pub async fn add_peer(
    State(state): State<AppState>,
    Json(payload): Json<AddPeerRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if payload.id.trim().is_empty() {
        return Err(AppError::Validation("Peer id cannot be empty".to_string()));
    }

    let peer = PeerConnection {
        id: payload.id.clone(),
        node_id: payload.node_id,
        endpoint: payload.endpoint,
        discovered: true,
    };
    let added = state.node.add_discovered_peer(peer, payload.outgoing).await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "peer": payload.id,
            "data_sources_added": added
        })),
    ))
}

/// Drop every wrapper bound to a peer
pub async fn unload_peer(State(state): State<AppState>, Path(id): Path<String>) -> Json<serde_json::Value> {
    let removed = state.node.unload_all_data_sources_for_peer(&id).await;
    Json(serde_json::json!({
        "peer": id,
        "data_sources_removed": removed
    }))
}

/// Load wrappers for peers that discovery knows about but tables do not yet include
pub async fn load_new_peers(State(state): State<AppState>) -> Json<serde_json::Value> {
    let added = state.node.load_all_data_sources_for_new_peers().await;
    Json(serde_json::json!({
        "data_sources_added": added
    }))
}

/// List endpoint pools
pub async fn list_pools(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "pools": state.node.pool_statuses().await
    }))
}
