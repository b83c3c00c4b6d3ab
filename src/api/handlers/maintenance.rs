// Server side of the node-to-node protocol
use axum::{extract::State, Json};

use super::AppState;
use crate::models::{MaintenanceRequest, MaintenanceResponse, ProbeRequest, ProbeResponse};

/// Answer a peer's heartbeat maintenance call
pub async fn maintain(
    State(state): State<AppState>,
    Json(request): Json<MaintenanceRequest>,
) -> Json<MaintenanceResponse> {
    Json(state.node.handle_maintenance(&request))
}

/// Answer a peer's probe statement
pub async fn probe(State(state): State<AppState>, Json(request): Json<ProbeRequest>) -> Json<ProbeResponse> {
    Json(state.node.handle_probe(&request))
}
