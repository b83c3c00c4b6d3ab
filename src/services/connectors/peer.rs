// Handles to peer federation nodes, spoken to over the node's HTTP API
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::adapter::{next_handle_id, Handle, HandleId, HandleKind, SourceHandle};
use crate::error::FederationError;
use crate::models::{mask_url, MaintenanceRequest, MaintenanceResponse, ProbeRequest, ProbeResponse};

pub struct PeerHandle {
    id: HandleId,
    client: reqwest::Client,
    base: Url,
    user: Option<String>,
    password: Option<String>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id)
            .field("base", &mask_url(self.base.as_str()))
            .finish()
    }
}

impl PeerHandle {
    /// Open a handle once the peer answers its health endpoint
    pub async fn connect(
        client: reqwest::Client,
        url: &str,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<Handle, FederationError> {
        let base = Url::parse(url)
            .map_err(|e| FederationError::InvalidDescriptor(format!("Invalid peer URL {}: {}", mask_url(url), e)))?;

        let handle = Self {
            id: next_handle_id(),
            client,
            base,
            user: user.map(str::to_string),
            password: password.map(str::to_string),
            closed: AtomicBool::new(false),
        };

        let response = handle
            .request(reqwest::Method::GET, "health")?
            .send()
            .await
            .map_err(|e| FederationError::PeerUnreachable(format!("{}: {}", mask_url(url), e)))?;
        if !response.status().is_success() {
            return Err(FederationError::PeerUnreachable(format!(
                "{} answered health check with {}",
                mask_url(url),
                response.status()
            )));
        }

        Ok(Arc::new(handle))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder, FederationError> {
        let url = self
            .base
            .join(path)
            .map_err(|e| FederationError::InvalidDescriptor(format!("Invalid peer path {}: {}", path, e)))?;
        let mut builder = self.client.request(method, url);
        if let Some(user) = &self.user {
            builder = builder.basic_auth(user, self.password.as_ref());
        }
        Ok(builder)
    }

    fn ensure_open(&self) -> Result<(), FederationError> {
        if self.is_closed() {
            return Err(FederationError::StaleHandle(format!("Peer handle {} is closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceHandle for PeerHandle {
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
        let request = match self.request(reqwest::Method::GET, "health") {
            Ok(r) => r.timeout(timeout),
            Err(_) => return false,
        };
        matches!(request.send().await, Ok(response) if response.status().is_success())
    }

    async fn execute_probe(&self, statement: &str) -> Result<(), FederationError> {
        self.ensure_open()?;
        let response = self
            .request(reqwest::Method::POST, "api/probe")?
            .json(&ProbeRequest {
                statement: statement.to_string(),
            })
            .send()
            .await
            .map_err(|e| FederationError::PeerUnreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FederationError::Backend(format!("Peer probe failed with {}", response.status())));
        }
        let body: ProbeResponse = response
            .json()
            .await
            .map_err(|e| FederationError::Backend(format!("Invalid probe reply: {}", e)))?;
        if body.ok {
            Ok(())
        } else {
            Err(FederationError::Backend(format!("Peer {} rejected probe", body.node_id)))
        }
    }

    async fn maintain(&self, request: &MaintenanceRequest) -> Result<Option<String>, FederationError> {
        self.ensure_open()?;
        let response = self
            .request(reqwest::Method::POST, "api/maintain")?
            .json(request)
            .send()
            .await
            .map_err(|e| FederationError::PeerUnreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FederationError::PeerUnreachable(format!(
                "Maintenance call failed with {}",
                response.status()
            )));
        }
        let body: MaintenanceResponse = response
            .json()
            .await
            .map_err(|e| FederationError::Backend(format!("Invalid maintenance reply: {}", e)))?;
        Ok(body.message)
    }

    async fn close(&self) -> Result<(), FederationError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
