use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use crate::error::FederationError;
use crate::models::{
    wrapper_name, DataSourceStatus, EndpointDescriptor, PeerConnection, SourceDef, SourceOptions, TableMetadata,
};
use crate::services::connectors::Handle;
use crate::services::endpoint_pool::{close_in_background, EndpointPoolManager};

/// How long a wrapper stays out of rotation after its endpoint is reported lost
pub const DEFAULT_DISABLE_DURATION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct SourceBinding {
    /// Physical table or sub-query on the endpoint
    target: String,
    options: SourceOptions,
}

struct CachedRows {
    rows: Arc<Vec<Value>>,
    loaded_at: Instant,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Stateful adapter binding one physical source, local or peer, to a logical table
pub struct DataSourceWrapper {
    name: String,
    table: String,
    descriptor: EndpointDescriptor,
    peer_connection_id: Option<String>,
    binding: RwLock<SourceBinding>,
    metadata: RwLock<Arc<TableMetadata>>,
    statements: Mutex<HashMap<String, u64>>,
    rows: Mutex<Option<CachedRows>>,
    disabled_until: Mutex<Option<Instant>>,
    closed: AtomicBool,
    pools: Arc<EndpointPoolManager>,
}

impl std::fmt::Debug for DataSourceWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceWrapper")
            .field("name", &self.name)
            .field("endpoint", &self.descriptor.masked())
            .finish()
    }
}

impl DataSourceWrapper {
    /// Build the wrapper for a locally defined source
    pub fn for_source(
        table: &str,
        source: &SourceDef,
        metadata: Arc<TableMetadata>,
        pools: Arc<EndpointPoolManager>,
    ) -> Result<Self, FederationError> {
        let name = wrapper_name(table, &source.name);
        source
            .endpoint
            .validate()
            .map_err(|e| FederationError::build_failure(&name, e))?;
        check_column_mapping(&source.options.columns, &metadata).map_err(|e| FederationError::build_failure(&name, e))?;

        Ok(Self::build(
            name,
            table,
            source.endpoint.clone(),
            None,
            SourceBinding {
                target: source.table.clone().unwrap_or_else(|| table.to_string()),
                options: source.options.clone(),
            },
            metadata,
            pools,
        ))
    }

    /// Build the wrapper through which a peer node contributes to a table
    pub fn for_peer(
        table: &str,
        peer: &PeerConnection,
        metadata: Arc<TableMetadata>,
        pools: Arc<EndpointPoolManager>,
    ) -> Result<Self, FederationError> {
        let name = wrapper_name(table, &peer.id);
        peer.endpoint
            .validate()
            .map_err(|e| FederationError::build_failure(&name, e))?;

        Ok(Self::build(
            name,
            table,
            peer.endpoint.clone(),
            Some(peer.id.clone()),
            SourceBinding {
                target: table.to_string(),
                options: SourceOptions {
                    peer: true,
                    ..Default::default()
                },
            },
            metadata,
            pools,
        ))
    }

    fn build(
        name: String,
        table: &str,
        descriptor: EndpointDescriptor,
        peer_connection_id: Option<String>,
        binding: SourceBinding,
        metadata: Arc<TableMetadata>,
        pools: Arc<EndpointPoolManager>,
    ) -> Self {
        tracing::debug!("Constructing data source {} on {}", name, descriptor);
        Self {
            name,
            table: table.to_string(),
            descriptor,
            peer_connection_id,
            binding: RwLock::new(binding),
            metadata: RwLock::new(metadata),
            statements: Mutex::new(HashMap::new()),
            rows: Mutex::new(None),
            disabled_until: Mutex::new(None),
            closed: AtomicBool::new(false),
            pools,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    /// Peer connection id, for wrappers that front another node
    pub fn peer_connection_id(&self) -> Option<&str> {
        self.peer_connection_id.as_deref()
    }

    pub fn is_peer(&self) -> bool {
        self.peer_connection_id.is_some() || self.options().peer
    }

    pub fn metadata(&self) -> Arc<TableMetadata> {
        self.metadata
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn target(&self) -> String {
        self.binding
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .target
            .clone()
    }

    pub fn options(&self) -> SourceOptions {
        self.binding
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .options
            .clone()
    }

    /// True when this wrapper can be reused for the given endpoint
    pub fn is_based_on(&self, descriptor: &EndpointDescriptor) -> bool {
        !self.is_closed() && self.descriptor == *descriptor
    }

    /// Rebind to new metadata and source options, keeping the statement cache warm
    pub fn reinitialise(&self, metadata: Arc<TableMetadata>, source: Option<&SourceDef>) -> Result<(), FederationError> {
        if self.is_closed() {
            return Err(FederationError::StaleHandle(format!("Data source {} is closed", self.name)));
        }

        let binding = match source {
            Some(def) => SourceBinding {
                target: def.table.clone().unwrap_or_else(|| self.table.clone()),
                options: def.options.clone(),
            },
            None => self
                .binding
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        };
        check_column_mapping(&binding.options.columns, &metadata)?;

        let shape_changed = self.metadata().definition != metadata.definition;
        if shape_changed || !binding.options.in_memory {
            *lock(&self.rows) = None;
        }

        *self.metadata.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = metadata;
        *self.binding.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = binding;
        tracing::debug!("Reinitialised data source {}", self.name);
        Ok(())
    }

    /// Retire the wrapper. Pooled handles stay with their endpoint pool.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.statements).clear();
        *lock(&self.rows) = None;
        tracing::debug!("Closed data source {}", self.name);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Key of the pool this wrapper draws handles from
    pub fn pool_key(&self) -> String {
        if self.options().in_memory {
            self.descriptor.in_memory_key()
        } else {
            self.descriptor.pool_key()
        }
    }

    /// Acquire a handle to the endpoint, honouring temporary disablement
    pub async fn acquire_handle(&self, timeout: Duration) -> Result<Handle, FederationError> {
        if self.is_closed() {
            return Err(FederationError::EndpointUnavailable(format!("Data source {} is closed", self.name)));
        }
        if !self.is_enabled() {
            return Err(FederationError::EndpointUnavailable(format!(
                "Data source {} is temporarily disabled",
                self.name
            )));
        }

        let pool = self
            .pools
            .get_or_create_pool_keyed(self.pool_key(), &self.descriptor)
            .await;
        match self.pools.acquire_from(pool.clone(), timeout).await {
            Err(FederationError::StaleHandle(_)) => self.pools.acquire_from(pool, timeout).await,
            other => other,
        }
    }

    pub async fn release_handle(&self, handle: Handle) {
        if let Err(rejected) = self.pools.release_keyed(&self.pool_key(), handle).await {
            close_in_background(vec![rejected]);
        }
    }

    /// Count a use of a statement against this source; returns the use count
    pub fn record_statement(&self, sql: &str) -> u64 {
        let mut statements = lock(&self.statements);
        let count = statements.entry(sql.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn cached_statement_count(&self) -> usize {
        lock(&self.statements).len()
    }

    /// Rows cached in memory, if the source is in-memory and the copy has not expired
    pub fn cached_rows(&self) -> Option<Arc<Vec<Value>>> {
        let options = self.options();
        if !options.in_memory {
            return None;
        }
        let mut rows = lock(&self.rows);
        let expired = match (rows.as_ref(), options.cache_expiry_secs) {
            (Some(cached), Some(secs)) => cached.loaded_at.elapsed() >= Duration::from_secs(secs),
            _ => false,
        };
        if expired {
            *rows = None;
        }
        rows.as_ref().map(|cached| cached.rows.clone())
    }

    /// Store an in-memory copy of the source's rows; ignored unless the source is in-memory
    pub fn cache_rows(&self, rows: Vec<Value>) -> bool {
        if !self.options().in_memory || self.is_closed() {
            return false;
        }
        *lock(&self.rows) = Some(CachedRows {
            rows: Arc::new(rows),
            loaded_at: Instant::now(),
        });
        true
    }

    pub fn temporarily_disable(&self, duration: Duration) {
        tracing::info!("Disabling data source {} for {} s", self.name, duration.as_secs());
        *lock(&self.disabled_until) = Some(Instant::now() + duration);
    }

    pub fn re_enable_now(&self) {
        *lock(&self.disabled_until) = None;
    }

    pub fn is_enabled(&self) -> bool {
        match *lock(&self.disabled_until) {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    pub fn status(&self) -> DataSourceStatus {
        DataSourceStatus {
            name: self.name.clone(),
            table: self.table.clone(),
            endpoint: self.descriptor.masked(),
            is_peer: self.is_peer(),
            enabled: self.is_enabled(),
            closed: self.is_closed(),
            in_memory: self.options().in_memory,
            cached_statements: self.cached_statement_count(),
        }
    }
}

fn check_column_mapping(columns: &[String], metadata: &TableMetadata) -> Result<(), FederationError> {
    match columns.iter().find(|c| !metadata.has_physical_column(c)) {
        Some(missing) => Err(FederationError::IncompatibleMetadata(format!(
            "Mapped column '{}' is not defined in logical table {}",
            missing, metadata.table
        ))),
        None => Ok(()),
    }
}
