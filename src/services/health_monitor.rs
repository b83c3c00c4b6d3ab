// Connection health monitor: peer maintenance and hanging-query detection
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;

use crate::models::{
    is_two_way_reply, parse_distance_to_server, MaintenanceRequest, TickReport, WRONG_DIRECTION_MESSAGE,
};
use crate::services::connectors::PROBE_STATEMENT;
use crate::services::discovery::Discovery;
use crate::services::endpoint_pool::{close_in_background, EndpointPoolManager};
use crate::services::reload::ReloadCoordinator;
use crate::services::wrapper::DataSourceWrapper;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Credentials and metadata this node presents to its peers
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: Option<String>,
}

struct SinkState {
    end: Mutex<Option<oneshot::Sender<()>>>,
    checking: AtomicBool,
}

/// Consumer side of a distributed query watched for hanging data sources
#[derive(Clone)]
pub struct QueryResultSink {
    state: Arc<SinkState>,
}

impl QueryResultSink {
    /// A sink and the receiver that gets the end-of-results signal
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let sink = Self {
            state: Arc::new(SinkState {
                end: Mutex::new(Some(tx)),
                checking: AtomicBool::new(true),
            }),
        };
        (sink, rx)
    }

    /// Signal end of results; only the first call delivers
    pub fn end_results(&self) -> bool {
        match lock(&self.state.end).take() {
            Some(tx) => {
                // receiver may already be gone
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_ended(&self) -> bool {
        lock(&self.state.end).is_none()
    }

    pub fn re_enable_checking_of_hanging_queries(&self) {
        self.state.checking.store(true, Ordering::Release);
    }

    /// False while a hanging check for this query is in flight
    pub fn is_checking_active(&self) -> bool {
        self.state.checking.load(Ordering::Acquire)
    }

    fn suspend_checking(&self) {
        self.state.checking.store(false, Ordering::Release);
    }
}

/// Data sources a distributed query is still waiting on
#[derive(Debug, Default)]
pub struct ExecutingSet {
    members: Mutex<Vec<Arc<DataSourceWrapper>>>,
}

impl ExecutingSet {
    pub fn new(members: Vec<Arc<DataSourceWrapper>>) -> Arc<Self> {
        Arc::new(Self {
            members: Mutex::new(members),
        })
    }

    pub fn members(&self) -> Vec<Arc<DataSourceWrapper>> {
        lock(&self.members).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.members).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.members).is_empty()
    }

    /// A member finished executing
    pub fn complete(&self, wrapper: &Arc<DataSourceWrapper>) -> bool {
        let mut members = lock(&self.members);
        let before = members.len();
        members.retain(|m| !Arc::ptr_eq(m, wrapper));
        members.len() != before
    }

    fn remove_all(&self, hanging: &[Arc<DataSourceWrapper>]) -> usize {
        let mut members = lock(&self.members);
        let before = members.len();
        members.retain(|m| !hanging.iter().any(|h| Arc::ptr_eq(m, h)));
        before - members.len()
    }
}

#[derive(Default)]
struct PendingProbes {
    data_sources: Vec<Arc<DataSourceWrapper>>,
    executing: Vec<(Arc<ExecutingSet>, QueryResultSink)>,
}

#[derive(Debug)]
enum Maintenance {
    TwoWay,
    Failed { wrong_direction: bool, reason: String },
}

impl Maintenance {
    fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::Failed {
            wrong_direction: reason.contains(WRONG_DIRECTION_MESSAGE),
            reason,
        }
    }
}

enum ProbeResult {
    Maintainer(String, Maintenance),
    Tester(usize, bool),
}

/// Periodic coordinator for connection maintainers and hanging-query testers.
///
/// Every probe runs as its own task bounded by the heartbeat. A tick only
/// observes the outcomes that arrived in time; stragglers finish in the
/// background and cannot affect a later tick.
pub struct ConnectionHealthMonitor {
    pools: Arc<EndpointPoolManager>,
    coordinator: Arc<ReloadCoordinator>,
    discovery: Arc<dyn Discovery>,
    identity: NodeIdentity,
    heartbeat_ms: AtomicU64,
    /// Also the exclusion scope for adding and dropping maintained connections
    maintained: AsyncMutex<HashSet<String>>,
    initialised: Mutex<HashSet<String>>,
    probes: Mutex<PendingProbes>,
}

impl ConnectionHealthMonitor {
    pub fn new(
        pools: Arc<EndpointPoolManager>,
        coordinator: Arc<ReloadCoordinator>,
        discovery: Arc<dyn Discovery>,
        identity: NodeIdentity,
        heartbeat: Duration,
    ) -> Self {
        Self {
            pools,
            coordinator,
            discovery,
            identity,
            heartbeat_ms: AtomicU64::new(heartbeat.as_millis() as u64),
            maintained: AsyncMutex::new(HashSet::new()),
            initialised: Mutex::new(HashSet::new()),
            probes: Mutex::new(PendingProbes::default()),
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.load(Ordering::Relaxed))
    }

    pub fn set_heartbeat(&self, heartbeat: Duration) {
        self.heartbeat_ms.store(heartbeat.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub async fn maintained_connections(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.maintained.lock().await.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Start maintaining a peer connection; the first call goes out immediately
    pub async fn maintain_two_way_connection(self: &Arc<Self>, connection_id: &str) {
        let added = self.maintained.lock().await.insert(connection_id.to_string());
        if !added {
            return;
        }
        tracing::info!("Maintaining two-way connection {}", connection_id);
        let monitor = self.clone();
        let id = connection_id.to_string();
        let timeout = self.heartbeat();
        tokio::spawn(async move {
            let outcome = monitor.run_maintainer(&id, timeout).await;
            tracing::debug!("Initial maintenance call for {}: {:?}", id, outcome);
        });
    }

    /// Register the sources of an executing query for a hanging check.
    /// Only queries involving a peer-node source are checked.
    pub fn root_out_hanging_data_sources(&self, executing: &Arc<ExecutingSet>, sink: &QueryResultSink) -> bool {
        let members = executing.members();
        if !members.iter().any(|w| w.is_peer()) {
            return false;
        }

        let mut probes = lock(&self.probes);
        for wrapper in members {
            if !probes.data_sources.iter().any(|d| Arc::ptr_eq(d, &wrapper)) {
                probes.data_sources.push(wrapper);
            }
        }
        probes.executing.push((executing.clone(), sink.clone()));
        sink.suspend_checking();
        true
    }

    /// Run one heartbeat: launch all probes, wait up to the heartbeat, then act
    pub async fn tick(self: &Arc<Self>) -> TickReport {
        let heartbeat = self.heartbeat();
        let maintained: Vec<String> = self.maintained.lock().await.iter().cloned().collect();
        let pending = std::mem::take(&mut *lock(&self.probes));
        let suspects: Vec<Arc<DataSourceWrapper>> = pending
            .data_sources
            .into_iter()
            .filter(|w| {
                if !w.is_peer() {
                    tracing::debug!("Not checking {}: not a peer-node source", w.name());
                }
                w.is_peer()
            })
            .collect();

        let mut tasks = JoinSet::new();
        for id in &maintained {
            let monitor = self.clone();
            let id = id.clone();
            tasks.spawn(async move {
                let outcome = monitor.run_maintainer(&id, heartbeat).await;
                ProbeResult::Maintainer(id, outcome)
            });
        }
        for (index, wrapper) in suspects.iter().enumerate() {
            let monitor = self.clone();
            let wrapper = wrapper.clone();
            tasks.spawn(async move { ProbeResult::Tester(index, monitor.run_tester(&wrapper, heartbeat).await) });
        }

        let mut outcomes: HashMap<String, Maintenance> = HashMap::new();
        let mut polled: HashSet<usize> = HashSet::new();
        let deadline = tokio::time::sleep(heartbeat);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                joined = tasks.join_next() => match joined {
                    Some(Ok(ProbeResult::Maintainer(id, outcome))) => {
                        outcomes.insert(id, outcome);
                    }
                    Some(Ok(ProbeResult::Tester(index, true))) => {
                        polled.insert(index);
                    }
                    Some(Ok(ProbeResult::Tester(_, false))) => {}
                    Some(Err(e)) => tracing::warn!("Health probe task failed: {}", e),
                    None => break,
                },
            }
        }
        tasks.detach_all();

        let mut report = TickReport {
            maintained: maintained.len(),
            probed: suspects.len(),
            ..Default::default()
        };

        let hanging: Vec<Arc<DataSourceWrapper>> = suspects
            .into_iter()
            .enumerate()
            .filter(|(index, _)| !polled.contains(index))
            .map(|(_, wrapper)| wrapper)
            .collect();
        for wrapper in &hanging {
            tracing::info!("Probe hanging for data source {}", wrapper.name());
            self.coordinator.lost_connection(wrapper).await;
            report.hanging.push(wrapper.name().to_string());
        }

        for (executing, sink) in pending.executing {
            let removed = executing.remove_all(&hanging);
            if removed > 0 {
                tracing::info!("Rooted out {} hanging data source(s) for query", removed);
                if executing.is_empty() && sink.end_results() {
                    tracing::info!("Ended results of a query with no executing data sources left");
                    report.ended_queries += 1;
                }
            }
            sink.re_enable_checking_of_hanging_queries();
        }

        for id in &maintained {
            let wrong_direction = match outcomes.get(id) {
                Some(Maintenance::TwoWay) => continue,
                Some(Maintenance::Failed { wrong_direction, reason }) => {
                    tracing::warn!("Maintenance check failed for connection {}: {}", id, reason);
                    *wrong_direction
                }
                None => {
                    tracing::warn!("Maintenance check for connection {} did not answer within {:?}", id, heartbeat);
                    false
                }
            };

            tracing::info!("Dropping maintained connection {}", id);
            let mut guard = self.maintained.lock().await;
            if self.discovery.is_discovered_connection(id)
                && (!wrong_direction || !self.discovery.reverse_maintenance_direction_to_incoming(id))
            {
                self.coordinator.handle_lost_peer(id).await;
            }
            guard.remove(id);
            lock(&self.initialised).remove(id);
            report.dropped.push(id.clone());
        }

        report
    }

    /// Tick every heartbeat until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Connection health monitor started, heartbeat {:?}", self.heartbeat());
        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = Instant::now();
            let report = self.tick().await;
            if !report.hanging.is_empty() || !report.dropped.is_empty() {
                tracing::info!(
                    "Heartbeat: {} hanging, {} dropped, {} quer(ies) ended",
                    report.hanging.len(),
                    report.dropped.len(),
                    report.ended_queries
                );
            }

            let pause = self.heartbeat().saturating_sub(started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Connection health monitor stopped");
    }

    async fn run_maintainer(&self, connection_id: &str, timeout: Duration) -> Maintenance {
        let Some(peer) = self.coordinator.peer(connection_id).await else {
            return Maintenance::failed(format!("Not a discovered or defined connection: {}", connection_id));
        };

        let first_call = lock(&self.initialised).insert(connection_id.to_string());
        let handle = match self.pools.acquire(&peer.endpoint, timeout).await {
            Ok(handle) => handle,
            Err(e) => return Maintenance::failed(e.to_string()),
        };

        let request = MaintenanceRequest {
            node_id: self.identity.node_id.clone(),
            user: self.identity.user.clone(),
            password: self.identity.password.clone(),
            extra_info: MaintenanceRequest::extra_info(
                first_call,
                self.identity.ssl_mode.as_deref(),
                self.discovery.distance_to_server(),
            ),
        };

        match handle.maintain(&request).await {
            Ok(reply) => {
                let outcome = if is_two_way_reply(reply.as_deref()) {
                    if let Some(distance) = reply.as_deref().and_then(parse_distance_to_server) {
                        self.discovery.offer_path_to_server(distance, peer.node_id());
                    }
                    tracing::debug!("Maintenance check succeeded for connection {}", connection_id);
                    Maintenance::TwoWay
                } else {
                    Maintenance::failed(reply.unwrap_or_default())
                };
                if let Err(rejected) = self.pools.release(&peer.endpoint, handle).await {
                    close_in_background(vec![rejected]);
                }
                outcome
            }
            Err(e) => {
                close_in_background(vec![handle]);
                Maintenance::failed(e.to_string())
            }
        }
    }

    async fn run_tester(&self, wrapper: &DataSourceWrapper, timeout: Duration) -> bool {
        let handle = match self.pools.acquire_with_retry(wrapper.descriptor(), timeout).await {
            Ok(handle) => handle,
            Err(e) => {
                // the query most likely completed while the check was being set up
                tracing::info!("Probe not executed against {}: no handle available ({})", wrapper.name(), e);
                wrapper.re_enable_now();
                return true;
            }
        };

        match tokio::time::timeout(timeout, handle.execute_probe(PROBE_STATEMENT)).await {
            Ok(Ok(())) => {
                tracing::debug!("Probe succeeded for data source {}", wrapper.name());
                wrapper.re_enable_now();
                if let Err(rejected) = self.pools.release(wrapper.descriptor(), handle).await {
                    close_in_background(vec![rejected]);
                }
                true
            }
            Ok(Err(e)) => {
                tracing::warn!("Unable to probe data source {}: {}", wrapper.name(), e);
                close_in_background(vec![handle]);
                false
            }
            Err(_) => {
                close_in_background(vec![handle]);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PeerConnection;
    use crate::services::config_source::MemoryConfigSource;
    use crate::services::discovery::PeerDirectory;
    use crate::services::registry::LogicalTableRegistry;
    use crate::services::testing::{
        definitions, peer, MaintenanceReply, MockBehaviour, MockConnector, RecordingDiscovery, RecordingViews,
    };

    const HEARTBEAT: Duration = Duration::from_millis(100);

    struct Fixture {
        monitor: Arc<ConnectionHealthMonitor>,
        coordinator: Arc<ReloadCoordinator>,
        registry: Arc<LogicalTableRegistry>,
        discovery: Arc<RecordingDiscovery>,
        mock: MockConnector,
    }

    async fn fixture(peers: Vec<PeerConnection>, discovered: &[&str], lite: bool) -> Fixture {
        let mock = MockConnector::new();
        let pools = Arc::new(EndpointPoolManager::new(Arc::new(mock.clone())));
        let registry = Arc::new(LogicalTableRegistry::new());
        let discovery = Arc::new(RecordingDiscovery::new(PeerDirectory::new(lite)));
        for id in discovered {
            discovery.inner.add_discovered(peer(id), true);
        }
        let coordinator = Arc::new(ReloadCoordinator::new(
            registry.clone(),
            pools.clone(),
            Arc::new(MemoryConfigSource::new(definitions(&[("t1", &["a"])], peers))),
            discovery.clone(),
            Arc::new(RecordingViews::default()),
        ));
        coordinator.refresh(None).await.unwrap();

        let identity = NodeIdentity {
            node_id: "n0".to_string(),
            user: "gdb".to_string(),
            password: "secret".to_string(),
            ssl_mode: Some("off".to_string()),
        };
        let monitor = Arc::new(ConnectionHealthMonitor::new(
            pools,
            coordinator.clone(),
            discovery.clone(),
            identity,
            HEARTBEAT,
        ));
        Fixture {
            monitor,
            coordinator,
            registry,
            discovery,
            mock,
        }
    }

    fn wrapper(f: &Fixture, name: &str) -> Arc<DataSourceWrapper> {
        f.registry.wrapper(name).unwrap()
    }

    #[tokio::test]
    async fn test_unresponsive_peer_is_dropped_and_reported_once() {
        let f = fixture(vec![], &["n1"], false).await;
        f.mock.set(&peer("n1").endpoint, MockBehaviour { probe_hangs: true, ..Default::default() });
        f.monitor.maintain_two_way_connection("n1").await;

        for _ in 0..3 {
            f.monitor.tick().await;
        }

        assert_eq!(f.discovery.lost(), vec!["n1"]);
        assert!(f.monitor.maintained_connections().await.is_empty());
        assert!(f.registry.wrapper("t1_n1").is_none());
        assert!(f.coordinator.peer("n1").await.is_none());
    }

    #[tokio::test]
    async fn test_healthy_peer_stays_maintained() {
        let f = fixture(vec![], &["n1"], false).await;
        f.monitor.maintain_two_way_connection("n1").await;

        let report = f.monitor.tick().await;
        assert_eq!(report.maintained, 1);
        assert!(report.dropped.is_empty());
        assert_eq!(f.monitor.maintained_connections().await, vec!["n1"]);
        assert!(f.discovery.lost().is_empty());
    }

    #[tokio::test]
    async fn test_first_maintenance_call_carries_init() {
        let f = fixture(vec![], &["n1"], false).await;
        f.monitor.maintain_two_way_connection("n1").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.monitor.tick().await;

        let requests = f.mock.maintenance_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].node_id, "n0");
        assert_eq!(requests[0].extra_info, "INIT,SSL:off,D2S:0");
        assert!(!requests[1].is_init());
    }

    #[tokio::test]
    async fn test_reply_distance_updates_path_to_server() {
        let f = fixture(vec![], &["n1"], true).await;
        f.mock.set(
            &peer("n1").endpoint,
            MockBehaviour {
                maintenance: MaintenanceReply::Message("SUCCESS:D2S:2".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(f.discovery.distance_to_server(), -1);

        f.monitor.maintain_two_way_connection("n1").await;
        let report = f.monitor.tick().await;
        assert!(report.dropped.is_empty());
        assert_eq!(f.discovery.distance_to_server(), 3);
        assert_eq!(f.discovery.inner.server_path().via.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn test_wrong_direction_hands_over_without_losing_peer() {
        let f = fixture(vec![], &["n1"], false).await;
        f.mock.set(
            &peer("n1").endpoint,
            MockBehaviour {
                maintenance: MaintenanceReply::Message(WRONG_DIRECTION_MESSAGE.to_string()),
                ..Default::default()
            },
        );
        f.monitor.maintain_two_way_connection("n1").await;

        let report = f.monitor.tick().await;
        assert_eq!(report.dropped, vec!["n1"]);
        assert!(f.discovery.lost().is_empty());
        assert!(f.discovery.inner.is_incoming("n1"));
        assert!(f.registry.wrapper("t1_n1").is_some());
    }

    #[tokio::test]
    async fn test_wrong_direction_without_hand_over_loses_peer() {
        let f = fixture(vec![], &["n1"], false).await;
        f.discovery.reverse_succeeds.store(false, Ordering::SeqCst);
        f.mock.set(
            &peer("n1").endpoint,
            MockBehaviour {
                maintenance: MaintenanceReply::Message(WRONG_DIRECTION_MESSAGE.to_string()),
                ..Default::default()
            },
        );
        f.monitor.maintain_two_way_connection("n1").await;

        f.monitor.tick().await;
        assert_eq!(f.discovery.lost(), vec!["n1"]);
    }

    #[tokio::test]
    async fn test_hanging_members_are_rooted_out_until_query_ends() {
        let f = fixture(vec![peer("n1"), peer("n2")], &[], false).await;
        let a = wrapper(&f, "t1_n1");
        let b = wrapper(&f, "t1_n2");
        let executing = ExecutingSet::new(vec![a.clone(), b.clone()]);
        let (sink, mut ended) = QueryResultSink::channel();

        f.mock.set(&peer("n2").endpoint, MockBehaviour { probe_hangs: true, ..Default::default() });
        assert!(f.monitor.root_out_hanging_data_sources(&executing, &sink));
        assert!(!sink.is_checking_active());

        let report = f.monitor.tick().await;
        assert_eq!(report.hanging, vec!["t1_n2"]);
        assert_eq!(executing.len(), 1);
        assert!(Arc::ptr_eq(&executing.members()[0], &a));
        assert!(!b.is_enabled());
        assert!(sink.is_checking_active());
        assert!(ended.try_recv().is_err());

        f.mock.set(&peer("n1").endpoint, MockBehaviour { probe_hangs: true, ..Default::default() });
        f.monitor.root_out_hanging_data_sources(&executing, &sink);
        let report = f.monitor.tick().await;
        assert_eq!(report.ended_queries, 1);
        assert!(executing.is_empty());
        assert!(ended.try_recv().is_ok());
        assert!(!sink.end_results());
    }

    #[tokio::test]
    async fn test_responsive_sources_are_re_enabled() {
        let f = fixture(vec![peer("n1")], &[], false).await;
        let a = wrapper(&f, "t1_n1");
        a.temporarily_disable(Duration::from_secs(30));
        let executing = ExecutingSet::new(vec![a.clone()]);
        let (sink, mut ended) = QueryResultSink::channel();

        f.monitor.root_out_hanging_data_sources(&executing, &sink);
        let report = f.monitor.tick().await;
        assert_eq!(report.probed, 1);
        assert!(report.hanging.is_empty());
        assert!(a.is_enabled());
        assert_eq!(executing.len(), 1);
        assert!(ended.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_queries_without_peer_sources_are_not_checked() {
        let f = fixture(vec![], &[], false).await;
        let executing = ExecutingSet::new(vec![wrapper(&f, "t1_a")]);
        let (sink, _ended) = QueryResultSink::channel();

        assert!(!f.monitor.root_out_hanging_data_sources(&executing, &sink));
        assert!(sink.is_checking_active());
        assert_eq!(f.monitor.tick().await.probed, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(vec![], &[], false).await;
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(f.monitor.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio_test::assert_ok!(tokio::time::timeout(Duration::from_secs(1), task).await);
    }
}
