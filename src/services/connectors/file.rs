// Local files exposed as child sources
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

use super::adapter::{next_handle_id, Handle, HandleId, HandleKind, SourceHandle};
use crate::error::FederationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileState {
    len: u64,
    modified: Option<SystemTime>,
}

#[derive(Debug)]
pub struct FileHandle {
    id: HandleId,
    path: PathBuf,
    state: Mutex<FileState>,
    closed: AtomicBool,
}

impl FileHandle {
    pub async fn open(path: &str) -> Result<Handle, FederationError> {
        let path = PathBuf::from(path);
        let state = Self::stat(&path).await?;
        Ok(Arc::new(Self {
            id: next_handle_id(),
            path,
            state: Mutex::new(state),
            closed: AtomicBool::new(false),
        }))
    }

    async fn stat(path: &PathBuf) -> Result<FileState, FederationError> {
        let meta = tokio::fs::metadata(path).await.map_err(|e| {
            FederationError::EndpointUnavailable(format!("Cannot read file {}: {}", path.display(), e))
        })?;
        if !meta.is_file() {
            return Err(FederationError::EndpointUnavailable(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        Ok(FileState {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

#[async_trait]
impl SourceHandle for FileHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn kind(&self) -> HandleKind {
        HandleKind::Child
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn is_valid(&self, _timeout: Duration) -> bool {
        !self.is_closed() && Self::stat(&self.path).await.is_ok()
    }

    async fn reinitialise(&self) -> Result<bool, FederationError> {
        if self.is_closed() {
            return Ok(false);
        }
        let fresh = Self::stat(&self.path).await?;
        let mut state = self.state.lock().await;
        if *state != fresh {
            tracing::debug!("File {} changed since last initialisation", self.path.display());
            *state = fresh;
        }
        Ok(true)
    }

    async fn execute_probe(&self, _statement: &str) -> Result<(), FederationError> {
        if self.is_closed() {
            return Err(FederationError::StaleHandle(format!("File handle {} is closed", self.id)));
        }
        Self::stat(&self.path).await.map(|_| ())
    }

    async fn close(&self) -> Result<(), FederationError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_file_handle_reinitialise_tracks_existence() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().to_string();

        let handle = FileHandle::open(&path).await.unwrap();
        assert_eq!(handle.kind(), HandleKind::Child);
        assert!(handle.reinitialise().await.unwrap());

        drop(file);
        assert!(handle.reinitialise().await.is_err());
        assert!(!handle.is_valid(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        assert!(matches!(
            FileHandle::open("/definitely/not/here.csv").await,
            Err(FederationError::EndpointUnavailable(_))
        ));
    }
}
