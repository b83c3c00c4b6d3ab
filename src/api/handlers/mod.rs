pub mod admin;
pub mod maintenance;

use std::sync::Arc;

use crate::services::FederationNode;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<FederationNode>,
}
