// MySQL / MariaDB handles, one mysql_async connection each
use async_trait::async_trait;
use mysql_async::{prelude::*, Conn, Opts, OptsBuilder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::adapter::{next_handle_id, Handle, HandleId, HandleKind, SourceHandle};
use crate::error::FederationError;
use crate::models::mask_url;

pub struct MySqlHandle {
    id: HandleId,
    conn: Mutex<Option<Conn>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MySqlHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlHandle").field("id", &self.id).finish()
    }
}

impl MySqlHandle {
    pub async fn connect(url: &str, user: Option<&str>, password: Option<&str>) -> Result<Handle, FederationError> {
        // mysql_async only understands the mysql:// scheme
        let normalized = match url.strip_prefix("mariadb://") {
            Some(rest) => format!("mysql://{}", rest),
            None => url.to_string(),
        };
        let opts = Opts::from_url(&normalized)
            .map_err(|e| FederationError::InvalidDescriptor(format!("Invalid MySQL URL {}: {}", mask_url(url), e)))?;

        let mut builder = OptsBuilder::from_opts(opts);
        if let Some(user) = user {
            builder = builder.user(Some(user.to_string()));
        }
        if let Some(password) = password {
            builder = builder.pass(Some(password.to_string()));
        }

        let conn = Conn::new(builder).await.map_err(|e| {
            FederationError::EndpointUnavailable(format!("Failed to connect to {}: {}", mask_url(url), e))
        })?;

        Ok(Arc::new(Self {
            id: next_handle_id(),
            conn: Mutex::new(Some(conn)),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl SourceHandle for MySqlHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn kind(&self) -> HandleKind {
        HandleKind::Relational
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn is_valid(&self, timeout: Duration) -> bool {
        let mut guard = self.conn.lock().await;
        match guard.as_mut() {
            Some(conn) => matches!(tokio::time::timeout(timeout, conn.ping()).await, Ok(Ok(()))),
            None => false,
        }
    }

    async fn execute_probe(&self, statement: &str) -> Result<(), FederationError> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| FederationError::StaleHandle(format!("MySQL handle {} is closed", self.id)))?;
        conn.query_drop(statement)
            .await
            .map_err(|e| FederationError::Backend(format!("MySQL statement failed: {}", e)))
    }

    async fn close(&self) -> Result<(), FederationError> {
        self.closed.store(true, Ordering::Release);
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.disconnect()
                .await
                .map_err(|e| FederationError::Backend(format!("Failed to close MySQL connection: {}", e)))?;
        }
        Ok(())
    }
}
