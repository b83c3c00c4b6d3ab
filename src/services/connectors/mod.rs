// Backend connectors producing source handles for endpoint descriptors
pub mod adapter;
pub mod file;
pub mod mysql;
pub mod peer;
pub mod postgresql;
pub mod sqlite;

pub use adapter::{next_handle_id, Connector, Handle, HandleId, HandleKind, SourceHandle, PROBE_STATEMENT};
pub use file::FileHandle;
pub use mysql::MySqlHandle;
pub use peer::PeerHandle;
pub use postgresql::PostgresHandle;
pub use sqlite::SqliteHandle;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::FederationError;
use crate::models::EndpointDescriptor;

/// Backend type behind an endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    PostgreSQL,
    MySQL,
    SQLite,
    Peer,
    File,
    Child,
}

impl BackendKind {
    pub fn for_descriptor(descriptor: &EndpointDescriptor) -> Result<Self, FederationError> {
        match descriptor {
            EndpointDescriptor::File { .. } => Ok(BackendKind::File),
            EndpointDescriptor::Child { .. } => Ok(BackendKind::Child),
            EndpointDescriptor::Relational { .. } => match descriptor.scheme().as_deref() {
                Some("postgresql") | Some("postgres") => Ok(BackendKind::PostgreSQL),
                Some("mysql") | Some("mariadb") => Ok(BackendKind::MySQL),
                Some("sqlite") => Ok(BackendKind::SQLite),
                Some("http") | Some("https") => Ok(BackendKind::Peer),
                _ => Err(FederationError::InvalidDescriptor(format!(
                    "Unsupported endpoint: {}",
                    descriptor
                ))),
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::PostgreSQL => "postgresql",
            BackendKind::MySQL => "mysql",
            BackendKind::SQLite => "sqlite",
            BackendKind::Peer => "peer",
            BackendKind::File => "file",
            BackendKind::Child => "child",
        }
    }
}

/// Connector dispatching to the built-in backends, plus registered child connectors
pub struct BackendConnector {
    http: reqwest::Client,
    children: HashMap<String, Arc<dyn Connector>>,
}

impl BackendConnector {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            children: HashMap::new(),
        }
    }

    /// Register a connector serving child descriptors of the given class
    pub fn with_child_connector(mut self, class: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        self.children.insert(class.into(), connector);
        self
    }
}

impl Default for BackendConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for BackendConnector {
    async fn connect(&self, descriptor: &EndpointDescriptor) -> Result<Handle, FederationError> {
        let kind = BackendKind::for_descriptor(descriptor)?;
        tracing::debug!("Connecting to {} endpoint {}", kind.as_str(), descriptor);

        match descriptor {
            EndpointDescriptor::Relational { url, user, password } => match kind {
                BackendKind::PostgreSQL => PostgresHandle::connect(url, user.as_deref(), password.as_deref()).await,
                BackendKind::MySQL => MySqlHandle::connect(url, user.as_deref(), password.as_deref()).await,
                BackendKind::SQLite => SqliteHandle::connect(url).await,
                _ => PeerHandle::connect(self.http.clone(), url, user.as_deref(), password.as_deref()).await,
            },
            EndpointDescriptor::File { path } => FileHandle::open(path).await,
            EndpointDescriptor::Child { class, .. } => match self.children.get(class) {
                Some(connector) => connector.connect(descriptor).await,
                None => Err(FederationError::InvalidDescriptor(format!(
                    "No connector registered for child class '{}'",
                    class
                ))),
            },
        }
    }
}
