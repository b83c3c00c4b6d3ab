use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::FederationError;
use crate::models::{
    DataSourceStatus, EndpointDescriptor, MaintenanceRequest, MaintenanceResponse, PeerConnection, PoolStatus,
    ProbeRequest, ProbeResponse, RefreshReport, TableStatus,
};
use crate::services::config_source::{ConfigSource, FileConfigSource, MemoryConfigSource};
use crate::services::connectors::{BackendConnector, Connector, Handle, PROBE_STATEMENT};
use crate::services::discovery::{Discovery, PeerDirectory};
use crate::services::endpoint_pool::{close_in_background, EndpointPoolManager};
use crate::services::health_monitor::{ConnectionHealthMonitor, ExecutingSet, QueryResultSink};
use crate::services::registry::{DataSourceArray, LogicalTableRegistry};
use crate::services::reload::ReloadCoordinator;
use crate::services::views::{DataFusionViewPublisher, ViewPublisher};

/// One federation node: pools, registry, reload coordination and health monitoring
pub struct FederationNode {
    config: Config,
    pools: Arc<EndpointPoolManager>,
    registry: Arc<LogicalTableRegistry>,
    coordinator: Arc<ReloadCoordinator>,
    monitor: Arc<ConnectionHealthMonitor>,
    directory: Arc<PeerDirectory>,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl FederationNode {
    pub fn new(
        config: Config,
        config_source: Arc<dyn ConfigSource>,
        connector: Arc<dyn Connector>,
        views: Arc<dyn ViewPublisher>,
    ) -> Self {
        let pools = Arc::new(EndpointPoolManager::with_settings(connector, config.pool_settings()));
        let registry = Arc::new(LogicalTableRegistry::new());
        let directory = Arc::new(PeerDirectory::new(config.node.lite));
        let discovery: Arc<dyn Discovery> = directory.clone();

        let coordinator = Arc::new(ReloadCoordinator::new(
            registry.clone(),
            pools.clone(),
            config_source,
            discovery.clone(),
            views,
        ));
        let monitor = Arc::new(ConnectionHealthMonitor::new(
            pools.clone(),
            coordinator.clone(),
            discovery,
            config.identity(),
            config.heartbeat(),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            pools,
            registry,
            coordinator,
            monitor,
            directory,
            shutdown,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Wire the built-in connectors, the definitions file and the DataFusion views
    pub fn from_config(config: Config) -> Self {
        let path = config.federation.definitions_path.trim().to_string();
        let config_source: Arc<dyn ConfigSource> = if path.is_empty() {
            tracing::info!("No definitions document configured; starting with no logical tables");
            Arc::new(MemoryConfigSource::default())
        } else {
            Arc::new(FileConfigSource::new(path))
        };
        Self::new(
            config,
            config_source,
            Arc::new(BackendConnector::new()),
            Arc::new(DataFusionViewPublisher::default()),
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<LogicalTableRegistry> {
        &self.registry
    }

    pub fn pools(&self) -> &Arc<EndpointPoolManager> {
        &self.pools
    }

    pub fn monitor(&self) -> &Arc<ConnectionHealthMonitor> {
        &self.monitor
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    // Query execution surface

    pub fn get_data_sources(&self, table: &str) -> Option<DataSourceArray> {
        self.registry.get_data_sources(table)
    }

    pub fn is_logical_table_loaded(&self, table: &str) -> bool {
        self.registry.is_logical_table_loaded(table)
    }

    pub async fn acquire_handle(&self, descriptor: &EndpointDescriptor, timeout: Duration) -> Result<Handle, FederationError> {
        self.pools.acquire_with_retry(descriptor, timeout).await
    }

    pub async fn release_handle(&self, descriptor: &EndpointDescriptor, handle: Handle) {
        if let Err(rejected) = self.pools.release(descriptor, handle).await {
            close_in_background(vec![rejected]);
        }
    }

    pub fn root_out_hanging_data_sources(&self, executing: &Arc<ExecutingSet>, sink: &QueryResultSink) -> bool {
        self.monitor.root_out_hanging_data_sources(executing, sink)
    }

    // Administrative surface

    pub async fn refresh(&self, tables: Option<&[String]>) -> Result<RefreshReport, FederationError> {
        self.coordinator.refresh(tables).await
    }

    pub async fn refresh_data_source(&self, table: &str, source: &str) -> Result<DataSourceStatus, FederationError> {
        let wrapper = self.coordinator.refresh_data_source(table, source).await?;
        Ok(wrapper.status())
    }

    pub async fn unload_all_data_sources_for_peer(&self, connection_id: &str) -> usize {
        self.coordinator.unload_all_data_sources_for_peer(connection_id).await
    }

    pub async fn load_all_data_sources_for_new_peers(&self) -> usize {
        self.coordinator.load_all_data_sources_for_new_peers().await
    }

    pub async fn close_all_data_sources_and_handles(&self) -> Result<(), FederationError> {
        self.coordinator.close_all_data_sources_and_handles().await
    }

    /// Federate with a newly discovered peer. An outgoing connection is
    /// maintained by this node. Returns the number of wrappers added.
    pub async fn add_discovered_peer(&self, peer: PeerConnection, outgoing: bool) -> Result<usize, FederationError> {
        peer.endpoint.validate()?;
        let id = peer.id.clone();
        if !self.directory.add_discovered(peer, outgoing) {
            tracing::debug!("Peer {} is already known", id);
            return Ok(0);
        }

        let added = self.coordinator.load_all_data_sources_for_new_peers().await;
        if outgoing {
            self.monitor.maintain_two_way_connection(&id).await;
        }
        Ok(added)
    }

    pub fn table_statuses(&self) -> Vec<TableStatus> {
        self.registry
            .loaded_table_names()
            .iter()
            .filter_map(|t| self.registry.table_status(t))
            .collect()
    }

    pub fn data_source_statuses(&self, table: &str) -> Option<Vec<DataSourceStatus>> {
        let array = self.registry.get_data_sources(table)?;
        Some(array.iter().map(|w| w.status()).collect())
    }

    pub async fn pool_statuses(&self) -> Vec<PoolStatus> {
        self.pools.statuses().await
    }

    // Node-to-node protocol, server side

    pub fn handle_maintenance(&self, request: &MaintenanceRequest) -> MaintenanceResponse {
        if request.user != self.config.node.user || request.password != self.config.node.password {
            tracing::warn!("Rejected maintenance call from {}: invalid credentials", request.node_id);
            return MaintenanceResponse::failure("Invalid credentials");
        }
        if let Some(reason) = self.directory.validate_incoming_maintenance(&request.node_id) {
            tracing::info!("Rejected maintenance call from {}: {}", request.node_id, reason);
            return MaintenanceResponse::failure(reason);
        }
        if request.is_init() {
            tracing::info!("First maintenance call from {}", request.node_id);
        }
        self.directory.register_incoming(&request.node_id);
        MaintenanceResponse::success(self.directory.distance_to_server())
    }

    pub fn handle_probe(&self, request: &ProbeRequest) -> ProbeResponse {
        ProbeResponse {
            ok: request.statement.trim().eq_ignore_ascii_case(PROBE_STATEMENT),
            node_id: self.config.node.id.clone(),
        }
    }

    // Lifecycle

    /// Spawn the health-monitor loop and the periodic refresh timer
    pub fn start_background(self: &Arc<Self>) {
        let monitor = tokio::spawn(self.monitor.clone().run(self.shutdown.subscribe()));

        let node = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.refresh_interval();
        let refresher = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = node.refresh(None).await {
                            tracing::warn!("Periodic refresh: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });

        let mut background = self.background.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        background.push(monitor);
        background.push(refresher);
    }

    /// Stop the background loops and close every data source and handle
    pub async fn shutdown(&self) -> Result<(), FederationError> {
        tracing::info!("Shutting down federation node {}", self.config.node.id);
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.background.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            if tokio::time::timeout(self.config.heartbeat() * 2, task).await.is_err() {
                tracing::warn!("Background task did not stop in time");
            }
        }
        self.close_all_data_sources_and_handles().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{definitions, peer, MockConnector, RecordingViews};

    fn node(config: Config, defs: crate::models::FederationDefinitions) -> (Arc<FederationNode>, MockConnector) {
        let mock = MockConnector::new();
        let node = FederationNode::new(
            config,
            Arc::new(MemoryConfigSource::new(defs)),
            Arc::new(mock.clone()),
            Arc::new(RecordingViews::default()),
        );
        (Arc::new(node), mock)
    }

    fn request(node_id: &str, password: &str, extra_info: &str) -> MaintenanceRequest {
        MaintenanceRequest {
            node_id: node_id.to_string(),
            user: "gdb".to_string(),
            password: password.to_string(),
            extra_info: extra_info.to_string(),
        }
    }

    #[tokio::test]
    async fn test_refresh_and_statuses() {
        let (node, _) = node(Config::for_tests(), definitions(&[("t1", &["a", "b"])], vec![peer("n1")]));
        node.refresh(None).await.unwrap();

        assert!(node.is_logical_table_loaded("t1"));
        assert_eq!(node.get_data_sources("t1").unwrap().len(), 3);
        let statuses = node.table_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].sources, vec!["t1_a", "t1_b", "t1_n1"]);
        let sources = node.data_source_statuses("t1").unwrap();
        assert!(sources[2].is_peer);
        assert!(node.data_source_statuses("missing").is_none());
    }

    #[tokio::test]
    async fn test_discovered_peer_grows_tables_and_is_maintained() {
        let (node, mock) = node(Config::for_tests(), definitions(&[("t1", &["a"]), ("t2", &["b"])], vec![]));
        node.refresh(None).await.unwrap();

        assert_eq!(node.add_discovered_peer(peer("n2"), true).await.unwrap(), 2);
        assert_eq!(node.add_discovered_peer(peer("n2"), true).await.unwrap(), 0);
        assert_eq!(node.get_data_sources("t2").unwrap()[1].name(), "t2_n2");
        assert_eq!(node.monitor().maintained_connections().await, vec!["n2"]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(mock.maintenance_requests()[0].is_init());
    }

    #[tokio::test]
    async fn test_invalid_discovered_peer_is_rejected() {
        let (node, _) = node(Config::for_tests(), definitions(&[], vec![]));
        let mut bad = peer("n9");
        bad.endpoint = EndpointDescriptor::relational("gopher://n9", None, None);
        assert!(matches!(
            node.add_discovered_peer(bad, true).await,
            Err(FederationError::InvalidDescriptor(_))
        ));
    }

    #[tokio::test]
    async fn test_maintenance_handshake() {
        let (node, _) = node(Config::for_tests(), definitions(&[], vec![]));

        let reply = node.handle_maintenance(&request("n5", "wrong", "D2S:-1"));
        assert_eq!(reply.message.as_deref(), Some("Invalid credentials"));

        let reply = node.handle_maintenance(&request("n5", "secret", "INIT,D2S:-1"));
        assert_eq!(reply.message.as_deref(), Some("SUCCESS:D2S:0"));
        assert!(node.directory().is_incoming("n5"));

        // this node already maintains n6 itself
        node.directory().add_discovered(peer("n6"), true);
        let reply = node.handle_maintenance(&request("n6", "secret", "D2S:0"));
        assert_eq!(reply.message.as_deref(), Some(crate::models::WRONG_DIRECTION_MESSAGE));
    }

    #[tokio::test]
    async fn test_probe_reply() {
        let (node, _) = node(Config::for_tests(), definitions(&[], vec![]));
        let ok = node.handle_probe(&ProbeRequest {
            statement: "select 1".to_string(),
        });
        assert!(ok.ok);
        assert_eq!(ok.node_id, "n0");
        assert!(!node.handle_probe(&ProbeRequest { statement: "DROP TABLE x".to_string() }).ok);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loops_and_closes_everything() {
        let (node, mock) = node(Config::for_tests(), definitions(&[("t1", &["a"])], vec![]));
        node.refresh(None).await.unwrap();
        node.start_background();
        tokio::time::sleep(Duration::from_millis(50)).await;

        node.shutdown().await.unwrap();
        assert!(!node.is_logical_table_loaded("t1"));
        assert_eq!(node.pool_statuses().await.len(), 0);
        assert_eq!(mock.closed_count(), mock.handles().len());
    }
}
