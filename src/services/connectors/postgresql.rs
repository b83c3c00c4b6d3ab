// PostgreSQL handles backed by a single tokio-postgres client per handle
use async_trait::async_trait;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::NoTls;

use super::adapter::{next_handle_id, Handle, HandleId, HandleKind, SourceHandle, PROBE_STATEMENT};
use crate::error::FederationError;
use crate::models::mask_url;

pub struct PostgresHandle {
    id: HandleId,
    client: tokio_postgres::Client,
    connection_task: JoinHandle<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PostgresHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresHandle").field("id", &self.id).finish()
    }
}

impl PostgresHandle {
    pub async fn connect(url: &str, user: Option<&str>, password: Option<&str>) -> Result<Handle, FederationError> {
        let mut config = tokio_postgres::Config::from_str(url)
            .map_err(|e| FederationError::InvalidDescriptor(format!("Invalid PostgreSQL URL {}: {}", mask_url(url), e)))?;
        if let Some(user) = user {
            config.user(user);
        }
        if let Some(password) = password {
            config.password(password);
        }

        let (client, connection) = config.connect(NoTls).await.map_err(|e| {
            FederationError::EndpointUnavailable(format!("Failed to connect to {}: {}", mask_url(url), e))
        })?;

        // The connection object performs the actual communication with the database
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("PostgreSQL connection ended with error: {}", e);
            }
        });

        Ok(Arc::new(Self {
            id: next_handle_id(),
            client,
            connection_task,
            closed: AtomicBool::new(false),
        }))
    }

    fn db_error(e: tokio_postgres::Error) -> FederationError {
        let details = if let Some(db_error) = e.as_db_error() {
            format!("Code: {}, Message: {}", db_error.code().code(), db_error.message())
        } else {
            e.to_string()
        };
        FederationError::Backend(format!("PostgreSQL statement failed: {}", details))
    }
}

#[async_trait]
impl SourceHandle for PostgresHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn kind(&self) -> HandleKind {
        HandleKind::Relational
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.client.is_closed()
    }

    async fn is_valid(&self, timeout: Duration) -> bool {
        if self.is_closed() {
            return false;
        }
        matches!(
            tokio::time::timeout(timeout, self.client.simple_query(PROBE_STATEMENT)).await,
            Ok(Ok(_))
        )
    }

    async fn execute_probe(&self, statement: &str) -> Result<(), FederationError> {
        if self.is_closed() {
            return Err(FederationError::StaleHandle(format!("PostgreSQL handle {} is closed", self.id)));
        }
        self.client
            .simple_query(statement)
            .await
            .map(|_| ())
            .map_err(Self::db_error)
    }

    async fn close(&self) -> Result<(), FederationError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.connection_task.abort();
        }
        Ok(())
    }
}
