// SQLite handles; rusqlite is synchronous so every call runs on the blocking pool
use async_trait::async_trait;
use rusqlite::Connection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::adapter::{next_handle_id, Handle, HandleId, HandleKind, SourceHandle, PROBE_STATEMENT};
use crate::error::FederationError;
use crate::models::sqlite_path;

pub struct SqliteHandle {
    id: HandleId,
    path: String,
    conn: Arc<Mutex<Option<Connection>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SqliteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

impl SqliteHandle {
    pub async fn connect(url: &str) -> Result<Handle, FederationError> {
        let path = sqlite_path(url).to_string();
        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || Connection::open(&open_path))
            .await
            .map_err(|e| FederationError::Backend(format!("SQLite open task failed: {}", e)))?
            .map_err(|e| FederationError::EndpointUnavailable(format!("Failed to open SQLite database {}: {}", path, e)))?;

        Ok(Arc::new(Self {
            id: next_handle_id(),
            path,
            conn: Arc::new(Mutex::new(Some(conn))),
            closed: AtomicBool::new(false),
        }))
    }

    async fn run(&self, statement: &str) -> Result<(), FederationError> {
        let conn = self.conn.clone();
        let statement = statement.to_string();
        let id = self.id;
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| FederationError::Backend("SQLite handle lock poisoned".to_string()))?;
            let conn = guard
                .as_ref()
                .ok_or_else(|| FederationError::StaleHandle(format!("SQLite handle {} is closed", id)))?;
            let mut stmt = conn
                .prepare(&statement)
                .map_err(|e| FederationError::Backend(format!("SQLite statement failed: {}", e)))?;
            let mut rows = stmt
                .query([])
                .map_err(|e| FederationError::Backend(format!("SQLite statement failed: {}", e)))?;
            rows.next()
                .map_err(|e| FederationError::Backend(format!("SQLite statement failed: {}", e)))?;
            Ok(())
        })
        .await
        .map_err(|e| FederationError::Backend(format!("SQLite task failed: {}", e)))?
    }
}

#[async_trait]
impl SourceHandle for SqliteHandle {
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
        if self.is_closed() {
            return false;
        }
        matches!(tokio::time::timeout(timeout, self.run(PROBE_STATEMENT)).await, Ok(Ok(())))
    }

    async fn execute_probe(&self, statement: &str) -> Result<(), FederationError> {
        self.run(statement).await
    }

    async fn close(&self) -> Result<(), FederationError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let taken = conn
                .lock()
                .map_err(|_| FederationError::Backend("SQLite handle lock poisoned".to_string()))?
                .take();
            match taken {
                Some(c) => c
                    .close()
                    .map_err(|(_, e)| FederationError::Backend(format!("Failed to close SQLite database: {}", e))),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| FederationError::Backend(format!("SQLite task failed: {}", e)))?
    }
}
