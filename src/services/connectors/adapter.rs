// Source handle and connector traits shared by every backend
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::FederationError;
use crate::models::{EndpointDescriptor, MaintenanceRequest};

/// Liveness probe statement run against endpoints
pub const PROBE_STATEMENT: &str = "SELECT 1";

pub type HandleId = u64;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique handle id
pub fn next_handle_id() -> HandleId {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// How a handle's validity is checked during the pre-load scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Checked with a bounded validity probe
    Relational,
    /// Checked by re-initialising the child source
    Child,
    Other,
}

/// An open connection or file handle to one endpoint
#[async_trait]
pub trait SourceHandle: Send + Sync + fmt::Debug {
    fn id(&self) -> HandleId;

    fn kind(&self) -> HandleKind;

    fn is_closed(&self) -> bool;

    /// Probe the handle, giving up after `timeout`
    async fn is_valid(&self, timeout: Duration) -> bool;

    /// Re-open the underlying source in place; `Ok(false)` when it no longer applies
    async fn reinitialise(&self) -> Result<bool, FederationError> {
        Ok(!self.is_closed())
    }

    /// Run a statement and discard its results
    async fn execute_probe(&self, statement: &str) -> Result<(), FederationError>;

    /// Send a maintenance request to a peer node and return its reply message
    async fn maintain(&self, _request: &MaintenanceRequest) -> Result<Option<String>, FederationError> {
        Err(FederationError::Backend(
            "Maintenance calls are only supported on peer-node handles".to_string(),
        ))
    }

    /// Close the handle; closing twice is a no-op
    async fn close(&self) -> Result<(), FederationError>;
}

pub type Handle = Arc<dyn SourceHandle>;

/// Opens handles for endpoint descriptors
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, descriptor: &EndpointDescriptor) -> Result<Handle, FederationError>;
}
