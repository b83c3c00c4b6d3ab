use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error taxonomy for data-source lifecycle and connection health
#[derive(Debug, Error)]
pub enum FederationError {
    #[error("Endpoint unavailable: {0}")]
    EndpointUnavailable(String),

    #[error("Stale handle: {0}")]
    StaleHandle(String),

    #[error("Unable to build data source {data_source}: {reason}")]
    SourceBuildFailure { data_source: String, reason: String },

    #[error("Reload partially failed for {} data source(s)", .0.len())]
    ReloadPartialFailure(Vec<SourceFailure>),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Query hanging on data source: {0}")]
    QueryHanging(String),

    #[error("Invalid endpoint descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Incompatible metadata: {0}")]
    IncompatibleMetadata(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("View regeneration failed for {table}: {reason}")]
    ViewRegeneration { table: String, reason: String },

    #[error("Failed to close {} handle(s) or data source(s)", .0.len())]
    CloseFailures(Vec<String>),
}

impl FederationError {
    pub fn build_failure(data_source: impl Into<String>, reason: impl ToString) -> Self {
        FederationError::SourceBuildFailure {
            data_source: data_source.into(),
            reason: reason.to_string(),
        }
    }
}

/// One failed table or data source in a refresh cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub table: String,
    pub data_source: Option<String>,
    pub reason: String,
}

impl SourceFailure {
    pub fn table(table: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            table: table.into(),
            data_source: None,
            reason: reason.to_string(),
        }
    }

    pub fn source(table: impl Into<String>, data_source: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            table: table.into(),
            data_source: Some(data_source.into()),
            reason: reason.to_string(),
        }
    }
}

impl From<config::ConfigError> for FederationError {
    fn from(err: config::ConfigError) -> Self {
        FederationError::Config(err.to_string())
    }
}

pub type Result<T, E = FederationError> = std::result::Result<T, E>;
