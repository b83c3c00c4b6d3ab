// Scriptable test doubles for connectors, views and discovery
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::FederationError;
use crate::models::{EndpointDescriptor, FederationDefinitions, MaintenanceRequest, PeerConnection, TableMetadata};
use crate::services::connectors::{next_handle_id, Connector, Handle, HandleId, HandleKind, SourceHandle};
use crate::services::discovery::{Discovery, PeerDirectory};
use crate::services::views::ViewPublisher;

#[derive(Debug, Clone, PartialEq)]
pub enum MaintenanceReply {
    Null,
    Message(String),
    Fail,
}

#[derive(Debug, Clone)]
pub struct MockBehaviour {
    pub connect_fails: bool,
    pub connect_delay: Duration,
    pub invalid: bool,
    pub probe_hangs: bool,
    pub probe_fails: bool,
    pub close_fails: bool,
    pub kind: HandleKind,
    pub maintenance: MaintenanceReply,
}

impl Default for MockBehaviour {
    fn default() -> Self {
        Self {
            connect_fails: false,
            connect_delay: Duration::ZERO,
            invalid: false,
            probe_hangs: false,
            probe_fails: false,
            close_fails: false,
            kind: HandleKind::Relational,
            maintenance: MaintenanceReply::Null,
        }
    }
}

#[derive(Default)]
struct MockState {
    behaviours: Mutex<HashMap<String, MockBehaviour>>,
    attempts: AtomicUsize,
    handles: Mutex<Vec<Arc<MockHandle>>>,
    maintenance_requests: Mutex<Vec<MaintenanceRequest>>,
}

impl MockState {
    fn behaviour(&self, key: &str) -> MockBehaviour {
        self.behaviours.lock().unwrap().get(key).cloned().unwrap_or_default()
    }
}

#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, descriptor: &EndpointDescriptor, behaviour: MockBehaviour) {
        self.state
            .behaviours
            .lock()
            .unwrap()
            .insert(descriptor.pool_key(), behaviour);
    }

    pub fn update(&self, descriptor: &EndpointDescriptor, f: impl FnOnce(&mut MockBehaviour)) {
        let mut behaviours = self.state.behaviours.lock().unwrap();
        f(behaviours.entry(descriptor.pool_key()).or_default());
    }

    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn handles(&self) -> Vec<Arc<MockHandle>> {
        self.state.handles.lock().unwrap().clone()
    }

    pub fn handles_for(&self, descriptor: &EndpointDescriptor) -> Vec<Arc<MockHandle>> {
        let key = descriptor.pool_key();
        self.handles().into_iter().filter(|h| h.key == key).collect()
    }

    pub fn closed_count(&self) -> usize {
        self.handles().iter().filter(|h| h.is_closed()).count()
    }

    pub fn maintenance_requests(&self) -> Vec<MaintenanceRequest> {
        self.state.maintenance_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, descriptor: &EndpointDescriptor) -> Result<Handle, FederationError> {
        let key = descriptor.pool_key();
        let behaviour = self.state.behaviour(&key);
        self.state.attempts.fetch_add(1, Ordering::SeqCst);

        if !behaviour.connect_delay.is_zero() {
            tokio::time::sleep(behaviour.connect_delay).await;
        }
        if behaviour.connect_fails {
            return Err(FederationError::EndpointUnavailable(format!("mock refused {}", descriptor)));
        }

        let handle = Arc::new(MockHandle {
            id: next_handle_id(),
            key,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        });
        self.state.handles.lock().unwrap().push(handle.clone());
        Ok(handle)
    }
}

pub struct MockHandle {
    id: HandleId,
    pub key: String,
    state: Arc<MockState>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHandle").field("id", &self.id).field("key", &self.key).finish()
    }
}

impl MockHandle {
    fn behaviour(&self) -> MockBehaviour {
        self.state.behaviour(&self.key)
    }

    /// Mark closed without going through the pool, as a dropped connection would
    pub fn break_connection(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceHandle for MockHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn kind(&self) -> HandleKind {
        self.behaviour().kind
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn is_valid(&self, timeout: Duration) -> bool {
        let b = self.behaviour();
        if b.probe_hangs {
            tokio::time::sleep(timeout).await;
            return false;
        }
        !self.is_closed() && !b.invalid
    }

    async fn reinitialise(&self) -> Result<bool, FederationError> {
        if self.behaviour().invalid {
            return Err(FederationError::EndpointUnavailable("mock source vanished".to_string()));
        }
        Ok(!self.is_closed())
    }

    async fn execute_probe(&self, _statement: &str) -> Result<(), FederationError> {
        let b = self.behaviour();
        if b.probe_hangs {
            std::future::pending::<()>().await;
        }
        if self.is_closed() {
            return Err(FederationError::StaleHandle("mock handle closed".to_string()));
        }
        if b.probe_fails {
            return Err(FederationError::Backend("mock probe failed".to_string()));
        }
        Ok(())
    }

    async fn maintain(&self, request: &MaintenanceRequest) -> Result<Option<String>, FederationError> {
        let b = self.behaviour();
        self.state.maintenance_requests.lock().unwrap().push(request.clone());
        if b.probe_hangs {
            std::future::pending::<()>().await;
        }
        match b.maintenance {
            MaintenanceReply::Null => Ok(None),
            MaintenanceReply::Message(m) => Ok(Some(m)),
            MaintenanceReply::Fail => Err(FederationError::PeerUnreachable("mock peer down".to_string())),
        }
    }

    async fn close(&self) -> Result<(), FederationError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.behaviour().close_fails {
            return Err(FederationError::Backend(format!("mock close failed for {}", self.id)));
        }
        Ok(())
    }
}

/// View publisher recording every call, failing for the configured tables
#[derive(Default)]
pub struct RecordingViews {
    pub published: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub failing: Mutex<HashSet<String>>,
}

impl RecordingViews {
    pub fn fail_for(&self, table: &str) {
        self.failing.lock().unwrap().insert(table.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn published(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl ViewPublisher for RecordingViews {
    async fn publish(&self, changed: &[Arc<TableMetadata>], removed: &[String]) -> Result<(), Vec<(String, String)>> {
        let failing = self.failing.lock().unwrap().clone();
        let mut errors = Vec::new();
        for meta in changed {
            if failing.contains(&meta.table) {
                errors.push((meta.table.clone(), "mock view failure".to_string()));
            } else {
                self.published.lock().unwrap().push(meta.table.clone());
            }
        }
        self.removed.lock().unwrap().extend(removed.iter().cloned());
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Discovery double delegating to a real directory while counting loss notifications
pub struct RecordingDiscovery {
    pub inner: PeerDirectory,
    pub lost: Mutex<Vec<String>>,
    pub reverse_succeeds: AtomicBool,
}

impl RecordingDiscovery {
    pub fn new(inner: PeerDirectory) -> Self {
        Self {
            inner,
            lost: Mutex::new(Vec::new()),
            reverse_succeeds: AtomicBool::new(true),
        }
    }

    pub fn lost(&self) -> Vec<String> {
        self.lost.lock().unwrap().clone()
    }
}

impl Discovery for RecordingDiscovery {
    fn current_peers(&self, defined: &[PeerConnection]) -> Vec<PeerConnection> {
        self.inner.current_peers(defined)
    }

    fn is_discovered_connection(&self, connection_id: &str) -> bool {
        self.inner.is_discovered_connection(connection_id)
    }

    fn lost_discovered_connection(&self, connection_id: &str) -> bool {
        self.lost.lock().unwrap().push(connection_id.to_string());
        self.inner.lost_discovered_connection(connection_id)
    }

    fn reverse_maintenance_direction_to_incoming(&self, connection_id: &str) -> bool {
        self.reverse_succeeds.load(Ordering::SeqCst) && self.inner.reverse_maintenance_direction_to_incoming(connection_id)
    }

    fn test_and_clear_config_reload_required(&self) -> bool {
        self.inner.test_and_clear_config_reload_required()
    }

    fn validate_incoming_maintenance(&self, sender_node_id: &str) -> Option<String> {
        self.inner.validate_incoming_maintenance(sender_node_id)
    }

    fn register_incoming(&self, sender_node_id: &str) {
        self.inner.register_incoming(sender_node_id)
    }

    fn distance_to_server(&self) -> i32 {
        self.inner.distance_to_server()
    }

    fn offer_path_to_server(&self, distance: i32, via_node: &str) -> bool {
        self.inner.offer_path_to_server(distance, via_node)
    }
}

/// Shorthand for a SQLite-style relational descriptor that only the mock connector serves
pub fn leaf(name: &str) -> EndpointDescriptor {
    EndpointDescriptor::relational(format!("sqlite:/mock/{}.db", name), None, None)
}

pub fn peer(id: &str) -> PeerConnection {
    PeerConnection {
        id: id.to_string(),
        node_id: None,
        endpoint: EndpointDescriptor::relational(format!("http://{}:3000", id), Some("gdb"), Some("gdb")),
        discovered: false,
    }
}

/// Build definitions with one table per `(name, sources)` entry, every source a mock leaf
pub fn definitions(tables: &[(&str, &[&str])], peers: Vec<PeerConnection>) -> FederationDefinitions {
    use crate::models::{LogicalTableDef, SourceDef};

    let mut defs = FederationDefinitions {
        peers,
        ..Default::default()
    };
    for (table, sources) in tables {
        defs.tables.insert(
            table.to_string(),
            LogicalTableDef {
                columns: "id INT, name VARCHAR(20)".to_string(),
                constants: vec![],
                sources: sources
                    .iter()
                    .map(|s| SourceDef {
                        name: s.to_string(),
                        endpoint: leaf(s),
                        table: None,
                        options: Default::default(),
                    })
                    .collect(),
            },
        );
    }
    defs
}
