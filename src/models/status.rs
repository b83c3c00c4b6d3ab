use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of one endpoint pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Pool key with secrets masked
    pub key: String,
    pub size: usize,
    /// Distinct handles ever pushed since the pool was created or last cleared
    pub max_observed: usize,
    pub max_size: usize,
    pub first_handle_id: Option<u64>,
    pub first_contact_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceStatus {
    pub name: String,
    pub table: String,
    pub endpoint: String,
    pub is_peer: bool,
    pub enabled: bool,
    pub closed: bool,
    pub in_memory: bool,
    pub cached_statements: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableStatus {
    pub name: String,
    pub columns: Vec<super::ResolvedColumn>,
    pub sources: Vec<String>,
}

/// Outcome of a refresh cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshReport {
    /// Tables whose wrapper array was rebuilt
    pub reloaded: Vec<String>,
    /// Tables skipped because nothing structural changed
    pub unchanged: Vec<String>,
    /// Tables no longer defined
    pub removed: Vec<String>,
    /// Wrappers scheduled for teardown
    pub retired: usize,
    /// Tables whose downstream view was regenerated
    pub views_regenerated: Vec<String>,
}

/// Outcome of one health-monitor heartbeat
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickReport {
    pub maintained: usize,
    pub probed: usize,
    pub hanging: Vec<String>,
    pub dropped: Vec<String>,
    pub ended_queries: usize,
}
