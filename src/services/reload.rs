use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{FederationError, SourceFailure};
use crate::models::{
    root_key, wrapper_name, EndpointDescriptor, FederationDefinitions, LogicalTableDef, PeerConnection, RefreshReport,
    SourceDef, TableMetadata,
};
use crate::services::config_source::ConfigSource;
use crate::services::discovery::Discovery;
use crate::services::endpoint_pool::EndpointPoolManager;
use crate::services::registry::LogicalTableRegistry;
use crate::services::views::ViewPublisher;
use crate::services::wrapper::{DataSourceWrapper, DEFAULT_DISABLE_DURATION};
use crate::validation::ColumnDefParser;

/// Everything about a table definition that forces its wrappers to be rebuilt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralSignature {
    parts: BTreeMap<String, String>,
    peers: Vec<String>,
}

impl StructuralSignature {
    pub fn compute(def: &LogicalTableDef, peers: &[PeerConnection]) -> Self {
        let mut parts = BTreeMap::new();
        parts.insert("columns".to_string(), def.view_signature());
        for source in &def.sources {
            let options = serde_json::to_string(&source.options).unwrap_or_default();
            parts.insert(
                format!("source:{}", source.name),
                format!(
                    "{}|{}|{}",
                    source.endpoint.pool_key(),
                    source.table.as_deref().unwrap_or(""),
                    options
                ),
            );
        }
        Self {
            parts,
            peers: sorted_peer_ids(peers),
        }
    }
}

fn sorted_peer_ids(peers: &[PeerConnection]) -> Vec<String> {
    let mut ids: Vec<String> = peers.iter().map(|p| p.id.clone()).collect();
    ids.sort();
    ids
}

#[derive(Default)]
struct ReloadState {
    /// Peers whose wrappers are currently loaded
    peers: Vec<PeerConnection>,
    peers_loaded: bool,
    defined_peers: Vec<PeerConnection>,
    signatures: HashMap<String, StructuralSignature>,
    view_signatures: HashMap<String, String>,
}

struct TableReload {
    view_changed: Option<Arc<TableMetadata>>,
    failures: Vec<SourceFailure>,
}

/// Reconciles the registry with the desired definitions.
///
/// Full refreshes and the peer add/remove fast paths all run under one
/// coordination scope. Network work (config loads, pool validation, view
/// publication, wrapper teardown) happens outside it.
pub struct ReloadCoordinator {
    registry: Arc<LogicalTableRegistry>,
    pools: Arc<EndpointPoolManager>,
    config_source: Arc<dyn ConfigSource>,
    discovery: Arc<dyn Discovery>,
    views: Arc<dyn ViewPublisher>,
    state: AsyncMutex<ReloadState>,
    last_refresh: Mutex<Option<DateTime<Utc>>>,
}

impl ReloadCoordinator {
    pub fn new(
        registry: Arc<LogicalTableRegistry>,
        pools: Arc<EndpointPoolManager>,
        config_source: Arc<dyn ConfigSource>,
        discovery: Arc<dyn Discovery>,
        views: Arc<dyn ViewPublisher>,
    ) -> Self {
        Self {
            registry,
            pools,
            config_source,
            discovery,
            views,
            state: AsyncMutex::new(ReloadState::default()),
            last_refresh: Mutex::new(None),
        }
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *self.last_refresh.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Peer connection currently federated under the given id
    pub async fn peer(&self, connection_id: &str) -> Option<PeerConnection> {
        let state = self.state.lock().await;
        state.peers.iter().find(|p| p.id == connection_id).cloned()
    }

    pub async fn peers(&self) -> Vec<PeerConnection> {
        self.state.lock().await.peers.clone()
    }

    /// Bring the given tables, or all tables, in line with the current definitions
    pub async fn refresh(&self, tables: Option<&[String]>) -> Result<RefreshReport, FederationError> {
        let mut requested = tables.map(|t| t.to_vec());
        if self.discovery.test_and_clear_config_reload_required() {
            tracing::info!("Discovery requested a full reload");
            requested = None;
        }

        let definitions = self.config_source.load().await?;

        let mut report = RefreshReport::default();
        let mut failures: Vec<SourceFailure> = Vec::new();
        let mut retired: Vec<Arc<DataSourceWrapper>> = Vec::new();
        let mut view_changes: Vec<Arc<TableMetadata>> = Vec::new();

        let peers = {
            let mut state = self.state.lock().await;
            let peers = self.discovery.current_peers(&definitions.peers);
            state.defined_peers = definitions.peers.clone();
            let peers_changed = !state.peers_loaded || sorted_peer_ids(&state.peers) != sorted_peer_ids(&peers);
            if peers_changed {
                tracing::info!("Peer connections changed; checking every requested table");
            }

            let to_check: Vec<String> = match &requested {
                Some(names) => names.clone(),
                None => definitions.tables.keys().cloned().collect(),
            };

            let mut rebuilt: HashSet<String> = HashSet::new();
            let mut fresh: HashMap<String, Arc<DataSourceWrapper>> = HashMap::new();

            for table in &to_check {
                let Some(def) = definitions.tables.get(table) else {
                    continue;
                };
                let signature = StructuralSignature::compute(def, &peers);
                if !peers_changed
                    && state.signatures.get(table) == Some(&signature)
                    && self.registry.is_logical_table_loaded(table)
                {
                    report.unchanged.push(table.clone());
                    continue;
                }

                rebuilt.insert(table.clone());
                match self.reload_logical_table(&mut state, table, def, &peers, &mut fresh, &mut retired) {
                    Ok(outcome) => {
                        report.reloaded.push(table.clone());
                        if let Some(metadata) = outcome.view_changed {
                            view_changes.push(metadata);
                        }
                        if outcome.failures.is_empty() {
                            state.signatures.insert(table.clone(), signature);
                        } else {
                            // No signature: the next refresh retries the failed sources
                            state.signatures.remove(table);
                            failures.extend(outcome.failures);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Unable to load logical table {}: {}", table, e);
                        // Prior array stays published, so its wrappers stay registered
                        rebuilt.remove(table);
                        state.signatures.remove(table);
                        failures.push(SourceFailure::table(table, e));
                    }
                }
            }

            let removed: Vec<String> = self
                .registry
                .loaded_table_names()
                .into_iter()
                .filter(|t| !definitions.tables.contains_key(t))
                .collect();
            for table in &removed {
                tracing::info!("Unloading logical table {} which is no longer defined", table);
                self.registry.remove_table(table);
                rebuilt.insert(table.clone());
            }
            state.signatures.retain(|t, _| definitions.tables.contains_key(t));
            state.view_signatures.retain(|t, _| definitions.tables.contains_key(t));

            // Wrappers of rebuilt or removed tables that were not carried over
            retired.extend(self.registry.take_wrappers_where(|w| !rebuilt.contains(w.table())));
            for wrapper in fresh.into_values() {
                self.registry.register_wrapper(wrapper);
            }

            state.peers = peers.clone();
            state.peers_loaded = true;
            report.removed = removed;
            peers
        };

        report.retired = retired.len();
        Self::teardown(retired);

        self.clean_and_preload_data_sources(&definitions, &peers).await;

        if !view_changes.is_empty() || !report.removed.is_empty() {
            let mut regenerated: Vec<String> = view_changes.iter().map(|m| m.table.clone()).collect();
            if let Err(errors) = self.views.publish(&view_changes, &report.removed).await {
                let mut state = self.state.lock().await;
                for (table, reason) in errors {
                    tracing::warn!("View regeneration failed for {}: {}", table, reason);
                    // Forget the signatures so the next refresh regenerates this view
                    state.view_signatures.remove(&table);
                    state.signatures.remove(&table);
                    regenerated.retain(|t| *t != table);
                    failures.push(SourceFailure::table(
                        &table,
                        FederationError::ViewRegeneration {
                            table: table.clone(),
                            reason,
                        },
                    ));
                }
            }
            report.views_regenerated = regenerated;
        }

        *self.last_refresh.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Utc::now());

        if failures.is_empty() {
            tracing::info!(
                "Refresh complete: {} reloaded, {} unchanged, {} removed",
                report.reloaded.len(),
                report.unchanged.len(),
                report.removed.len()
            );
            Ok(report)
        } else {
            tracing::warn!("Refresh completed with {} failure(s)", failures.len());
            Err(FederationError::ReloadPartialFailure(failures))
        }
    }

    fn reload_logical_table(
        &self,
        state: &mut ReloadState,
        table: &str,
        def: &LogicalTableDef,
        peers: &[PeerConnection],
        fresh: &mut HashMap<String, Arc<DataSourceWrapper>>,
        retired: &mut Vec<Arc<DataSourceWrapper>>,
    ) -> Result<TableReload, FederationError> {
        tracing::debug!("Reloading logical table {}", table);

        let view_signature = def.view_signature();
        let (metadata, view_changed) = match (state.view_signatures.get(table), self.registry.metadata(table)) {
            (Some(signature), Some(metadata)) if *signature == view_signature => (metadata, None),
            _ => {
                let metadata = Arc::new(ColumnDefParser::build_metadata(table, def)?);
                state.view_signatures.insert(table.to_string(), view_signature);
                self.registry.set_metadata(table, metadata.clone());
                (metadata.clone(), Some(metadata))
            }
        };

        let mut array = Vec::with_capacity(def.sources.len() + peers.len());
        let mut failures = Vec::new();

        for source in &def.sources {
            let name = wrapper_name(table, &source.name);
            let built = if fresh.contains_key(&name) {
                Err(FederationError::build_failure(&name, "duplicate data source name"))
            } else if source.options.peer && peers.iter().any(|p| p.endpoint == source.endpoint) {
                Err(FederationError::build_failure(
                    &name,
                    "duplicates a globally defined peer connection",
                ))
            } else {
                self.reuse_or_build(&name, &source.endpoint, &metadata, Some(source), retired, || {
                    DataSourceWrapper::for_source(table, source, metadata.clone(), self.pools.clone())
                })
            };
            match built {
                Ok(wrapper) => {
                    fresh.insert(name, wrapper.clone());
                    array.push(wrapper);
                }
                Err(e) => {
                    tracing::warn!("Unable to load data source {}: {}", name, e);
                    failures.push(SourceFailure::source(table, &name, e));
                }
            }
        }

        for peer in peers {
            let name = wrapper_name(table, &peer.id);
            let built = if fresh.contains_key(&name) {
                Err(FederationError::build_failure(&name, "duplicate data source name"))
            } else {
                self.reuse_or_build(&name, &peer.endpoint, &metadata, None, retired, || {
                    DataSourceWrapper::for_peer(table, peer, metadata.clone(), self.pools.clone())
                })
            };
            match built {
                Ok(wrapper) => {
                    fresh.insert(name, wrapper.clone());
                    array.push(wrapper);
                }
                Err(e) => {
                    tracing::warn!("Unable to load peer data source {}: {}", name, e);
                    failures.push(SourceFailure::source(table, &name, e));
                }
            }
        }

        self.registry.publish(table, array);
        Ok(TableReload { view_changed, failures })
    }

    /// Reuse the registered wrapper of that name when it is based on the same
    /// endpoint and accepts the new metadata; otherwise retire it and build anew.
    fn reuse_or_build(
        &self,
        name: &str,
        descriptor: &EndpointDescriptor,
        metadata: &Arc<TableMetadata>,
        source: Option<&SourceDef>,
        retired: &mut Vec<Arc<DataSourceWrapper>>,
        build: impl FnOnce() -> Result<DataSourceWrapper, FederationError>,
    ) -> Result<Arc<DataSourceWrapper>, FederationError> {
        if let Some(existing) = self.registry.take_wrapper(name) {
            if existing.is_based_on(descriptor) {
                match existing.reinitialise(metadata.clone(), source) {
                    Ok(()) => return Ok(existing),
                    Err(e) => {
                        tracing::info!("Data source {} cannot be reinitialised, rebuilding: {}", name, e);
                        retired.push(existing);
                    }
                }
            } else {
                tracing::info!("Endpoint of data source {} changed, rebuilding", name);
                retired.push(existing);
            }
        }
        build().map(Arc::new)
    }

    fn teardown(retired: Vec<Arc<DataSourceWrapper>>) {
        if retired.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for wrapper in retired {
                wrapper.close();
            }
        });
    }

    /// Purge pools nobody references or whose idle handle fails validation, then
    /// prime a handle for every referenced relational endpoint.
    async fn clean_and_preload_data_sources(&self, definitions: &FederationDefinitions, peers: &[PeerConnection]) {
        let mut referenced: HashSet<String> = HashSet::new();
        let mut relational: HashMap<String, EndpointDescriptor> = HashMap::new();
        let mut discovered_by_key: HashMap<String, String> = HashMap::new();

        for def in definitions.tables.values() {
            for source in &def.sources {
                let key = source.endpoint.pool_key();
                if source.endpoint.is_relational() {
                    relational.insert(key.clone(), source.endpoint.clone());
                }
                referenced.insert(key);
            }
        }
        for peer in peers {
            let key = peer.endpoint.pool_key();
            relational.insert(key.clone(), peer.endpoint.clone());
            referenced.insert(key.clone());
            if self.discovery.is_discovered_connection(&peer.id) {
                discovered_by_key.insert(key, peer.id.clone());
            }
        }

        let mut suspect = Vec::new();
        for key in self.pools.pool_keys().await {
            if referenced.contains(root_key(&key)) {
                suspect.push(key);
            } else {
                tracing::info!("Clearing endpoint pool that is no longer referenced");
                self.pools.purge(&key).await;
            }
        }

        let checks = suspect.into_iter().map(|key| async move {
            let valid = self.pools.validate(&key).await;
            (key, valid)
        });
        let mut lost = HashSet::new();
        for (key, valid) in futures::future::join_all(checks).await {
            if valid {
                continue;
            }
            let root = root_key(&key).to_string();
            match discovered_by_key.get(&root) {
                Some(connection_id) => {
                    tracing::warn!("Discovered peer {} failed validation", connection_id);
                    if lost.insert(root) {
                        self.handle_lost_peer(connection_id).await;
                    }
                }
                None => {
                    tracing::info!("Purging endpoint pool holding an invalid handle");
                    self.pools.purge(&key).await;
                }
            }
        }

        self.pools
            .set_referenced(relational.keys().filter(|k| !lost.contains(*k)).cloned().collect());
        for (key, descriptor) in &relational {
            if !lost.contains(key) {
                self.pools.prime(descriptor).await;
            }
        }
    }

    /// Notify discovery that a peer is gone and drop its wrappers from every table
    pub async fn handle_lost_peer(&self, connection_id: &str) -> bool {
        let notified = self.discovery.lost_discovered_connection(connection_id);
        self.unload_all_data_sources_for_peer(connection_id).await;
        notified
    }

    /// React to a wrapper whose endpoint stopped answering
    pub async fn lost_connection(&self, wrapper: &DataSourceWrapper) {
        match wrapper.peer_connection_id() {
            Some(id) if self.discovery.is_discovered_connection(id) => {
                self.handle_lost_peer(id).await;
            }
            _ => {
                tracing::warn!("Lost connection for data source {}", wrapper.name());
                self.pools.purge_descriptor(wrapper.descriptor()).await;
                wrapper.temporarily_disable(DEFAULT_DISABLE_DURATION);
            }
        }
    }

    /// Remove a peer's wrapper from every loaded table and purge its pool.
    /// Returns the number of wrappers removed.
    pub async fn unload_all_data_sources_for_peer(&self, connection_id: &str) -> usize {
        let mut orphans: Vec<Arc<DataSourceWrapper>> = Vec::new();
        let descriptor = {
            let mut state = self.state.lock().await;
            let mut descriptor = state
                .peers
                .iter()
                .find(|p| p.id == connection_id)
                .map(|p| p.endpoint.clone());

            for table in self.registry.loaded_table_names() {
                let name = wrapper_name(&table, connection_id);
                let registered = self.registry.take_wrapper(&name);
                let Some(current) = self.registry.get_data_sources(&table) else {
                    continue;
                };
                match current.iter().rposition(|w| w.name() == name) {
                    Some(position) => {
                        let mut next = current.to_vec();
                        // Swap with the last wrapper and shrink by one
                        let orphan = next.swap_remove(position);
                        self.registry.publish(&table, next);
                        orphans.push(orphan);
                    }
                    None => {
                        tracing::debug!("No data source {} loaded for table {}", name, table);
                        orphans.extend(registered);
                    }
                }
            }

            if descriptor.is_none() {
                descriptor = orphans.first().map(|w| w.descriptor().clone());
            }
            state.peers.retain(|p| p.id != connection_id);
            for signature in state.signatures.values_mut() {
                signature.peers.retain(|id| id != connection_id);
            }
            descriptor
        };

        let count = orphans.len();
        tracing::info!("Unloaded {} data source(s) for peer {}", count, connection_id);
        Self::teardown(orphans);
        if let Some(descriptor) = descriptor {
            self.pools.purge_descriptor(&descriptor).await;
        }
        count
    }

    /// Append a wrapper for every newly discovered peer to every loaded table.
    /// Returns the number of wrappers added.
    pub async fn load_all_data_sources_for_new_peers(&self) -> usize {
        let mut state = self.state.lock().await;
        let peers = self.discovery.current_peers(&state.defined_peers);
        let new_peers: Vec<PeerConnection> = peers
            .into_iter()
            .filter(|p| !state.peers.iter().any(|q| q.id == p.id))
            .collect();
        if new_peers.is_empty() {
            return 0;
        }

        let mut added = 0;
        for table in self.registry.loaded_table_names() {
            let (Some(metadata), Some(current)) = (self.registry.metadata(&table), self.registry.get_data_sources(&table))
            else {
                continue;
            };
            let mut next = current.to_vec();
            for peer in &new_peers {
                match DataSourceWrapper::for_peer(&table, peer, metadata.clone(), self.pools.clone()) {
                    Ok(wrapper) => {
                        let wrapper = Arc::new(wrapper);
                        self.registry.register_wrapper(wrapper.clone());
                        next.push(wrapper);
                        added += 1;
                    }
                    Err(e) => tracing::warn!("Unable to load peer data source for {}: {}", table, e),
                }
            }
            self.registry.publish(&table, next);
        }

        for peer in &new_peers {
            tracing::info!("Loaded data sources for new peer {}", peer.id);
        }
        state.peers.extend(new_peers);
        let ids = sorted_peer_ids(&state.peers);
        for signature in state.signatures.values_mut() {
            signature.peers = ids.clone();
        }
        added
    }

    /// Load or reload a single local data source of a loaded table
    pub async fn refresh_data_source(&self, table: &str, source_name: &str) -> Result<Arc<DataSourceWrapper>, FederationError> {
        let definitions = self.config_source.load().await?;
        let def = definitions
            .tables
            .get(table)
            .ok_or_else(|| FederationError::NotFound(format!("Logical table {} is not defined", table)))?;
        let source = def.source(source_name).ok_or_else(|| {
            FederationError::NotFound(format!("Data source {} is not defined for table {}", source_name, table))
        })?;

        let mut retired = Vec::new();
        let wrapper = {
            let mut state = self.state.lock().await;
            let metadata = self
                .registry
                .metadata(table)
                .ok_or_else(|| FederationError::NotFound(format!("Logical table {} is not loaded", table)))?;
            let name = wrapper_name(table, source_name);
            let wrapper = self.reuse_or_build(&name, &source.endpoint, &metadata, Some(source), &mut retired, || {
                DataSourceWrapper::for_source(table, source, metadata.clone(), self.pools.clone())
            })?;
            self.registry.register_wrapper(wrapper.clone());

            let mut next = self
                .registry
                .get_data_sources(table)
                .map(|current| current.to_vec())
                .unwrap_or_default();
            match next.iter().position(|w| w.name() == name) {
                Some(i) => next[i] = wrapper.clone(),
                None => {
                    // Local sources stay ahead of the peer wrappers
                    let at = next
                        .iter()
                        .position(|w| w.peer_connection_id().is_some())
                        .unwrap_or(next.len());
                    next.insert(at, wrapper.clone());
                }
            }

            let complete = def
                .sources
                .iter()
                .all(|s| next.iter().any(|w| w.name() == wrapper_name(table, &s.name)));
            self.registry.publish(table, next);

            if complete && state.view_signatures.get(table) == Some(&def.view_signature()) {
                let signature = StructuralSignature::compute(def, &state.peers);
                state.signatures.insert(table.to_string(), signature);
            }
            wrapper
        };

        Self::teardown(retired);
        tracing::info!("Refreshed data source {}", wrapper.name());
        Ok(wrapper)
    }

    /// Close every wrapper and every pooled handle, collecting close failures
    pub async fn close_all_data_sources_and_handles(&self) -> Result<(), FederationError> {
        let wrappers = {
            let mut state = self.state.lock().await;
            *state = ReloadState::default();
            self.registry.clear()
        };
        for wrapper in &wrappers {
            wrapper.close();
        }

        let errors = self.pools.close_all().await;
        tracing::info!(
            "Closed {} data source(s); {} handle close failure(s)",
            wrappers.len(),
            errors.len()
        );
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FederationError::CloseFailures(errors))
        }
    }
}
