use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, RwLock};

use crate::error::FederationError;
use crate::models::{mask_key, EndpointDescriptor, PoolStatus};
use crate::services::connectors::{Connector, Handle, HandleId, HandleKind};

/// Wait used when a query needs a handle and the pool is empty
pub const MIN_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
/// Floor applied to connects made shortly after a pool is first created
pub const FIRST_CONNECT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_size: usize,
    pub min_connect_timeout: Duration,
    pub first_connect_grace: Duration,
    /// Bound on validity probes during the pre-load scan and on shutdown closes
    pub validation_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_connect_timeout: MIN_CONNECT_TIMEOUT,
            first_connect_grace: FIRST_CONNECT_GRACE,
            validation_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Default)]
struct StackState {
    handles: Vec<Handle>,
    historical: HashSet<HandleId>,
    first_pushed: Option<HandleId>,
}

/// Bounded LIFO stack of idle handles for one endpoint.
///
/// Remembers every handle ever pushed (`max_observed`) and the first one, until
/// the pool is purged.
pub struct EndpointPool {
    key: String,
    descriptor: EndpointDescriptor,
    max_size: usize,
    first_contact_at: DateTime<Utc>,
    purged: AtomicBool,
    state: Mutex<StackState>,
}

impl EndpointPool {
    pub fn new(key: impl Into<String>, descriptor: EndpointDescriptor, max_size: usize) -> Self {
        Self {
            key: key.into(),
            descriptor,
            max_size,
            first_contact_at: Utc::now(),
            purged: AtomicBool::new(false),
            state: Mutex::new(StackState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, StackState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    /// Push an idle handle; a full or purged pool hands it back to the caller
    pub fn push(&self, handle: Handle) -> Result<(), Handle> {
        let mut state = self.state();
        if self.purged.load(Ordering::Acquire) || state.handles.len() >= self.max_size {
            return Err(handle);
        }
        let id = handle.id();
        if state.first_pushed.is_none() {
            state.first_pushed = Some(id);
        }
        state.historical.insert(id);
        state.handles.push(handle);
        Ok(())
    }

    pub fn pop(&self) -> Option<Handle> {
        self.state().handles.pop()
    }

    pub fn peek(&self) -> Option<Handle> {
        self.state().handles.last().cloned()
    }

    pub fn size(&self) -> usize {
        self.state().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn max_observed(&self) -> usize {
        self.state().historical.len()
    }

    pub fn first_handle_id(&self) -> Option<HandleId> {
        self.state().first_pushed
    }

    pub fn is_purged(&self) -> bool {
        self.purged.load(Ordering::Acquire)
    }

    /// Mark purged and take every idle handle; later pushes are rejected
    fn detach(&self) -> Vec<Handle> {
        let mut state = self.state();
        self.purged.store(true, Ordering::Release);
        state.historical.clear();
        state.first_pushed = None;
        std::mem::take(&mut state.handles)
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state();
        PoolStatus {
            key: mask_key(&self.key),
            size: state.handles.len(),
            max_observed: state.historical.len(),
            max_size: self.max_size,
            first_handle_id: state.first_pushed,
            first_contact_at: self.first_contact_at,
        }
    }
}

/// Registry of endpoint pools, one per pool key, shared across all wrappers
pub struct EndpointPoolManager {
    pools: Arc<RwLock<HashMap<String, Arc<EndpointPool>>>>,
    first_attempts: Mutex<HashMap<String, Instant>>,
    referenced: Mutex<HashSet<String>>,
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
}

impl EndpointPoolManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_settings(connector, PoolSettings::default())
    }

    pub fn with_settings(connector: Arc<dyn Connector>, settings: PoolSettings) -> Self {
        Self {
            pools: Arc::new(RwLock::new(HashMap::new())),
            first_attempts: Mutex::new(HashMap::new()),
            referenced: Mutex::new(HashSet::new()),
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub async fn get_pool(&self, key: &str) -> Option<Arc<EndpointPool>> {
        self.pools.read().await.get(key).cloned()
    }

    /// Get or create the pool for a descriptor's main key
    pub async fn get_or_create_pool(&self, descriptor: &EndpointDescriptor) -> Arc<EndpointPool> {
        self.get_or_create_pool_keyed(descriptor.pool_key(), descriptor).await
    }

    /// Get or create a pool under an explicit key, e.g. the in-memory variant
    pub async fn get_or_create_pool_keyed(&self, key: String, descriptor: &EndpointDescriptor) -> Arc<EndpointPool> {
        // Fast path: check if pool already exists (read lock)
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(&key) {
                return pool.clone();
            }
        }

        let mut pools = self.pools.write().await;

        // Double-check in case another task created the pool while we were waiting
        if let Some(pool) = pools.get(&key) {
            return pool.clone();
        }

        tracing::info!(
            "Creating endpoint pool for: {} (max_size: {})",
            mask_key(&key),
            self.settings.max_size
        );
        let pool = Arc::new(EndpointPool::new(key.clone(), descriptor.clone(), self.settings.max_size));
        self.first_attempts_guard().insert(key.clone(), Instant::now());
        pools.insert(key, pool.clone());
        pool
    }

    fn first_attempts_guard(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.first_attempts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Extend a requested connect timeout to the grace floor while the pool is new
    pub fn effective_timeout(&self, key: &str, requested: Duration) -> Duration {
        let now = Instant::now();
        let first = *self.first_attempts_guard().entry(key.to_string()).or_insert(now);
        let grace = self.settings.first_connect_grace;
        if now + requested < first + grace {
            requested.max(grace)
        } else {
            requested
        }
    }

    /// Take an idle handle, or connect one within `timeout`, keeping one spare in flight
    pub async fn acquire(&self, descriptor: &EndpointDescriptor, timeout: Duration) -> Result<Handle, FederationError> {
        let pool = self.get_or_create_pool(descriptor).await;
        self.acquire_from(pool, timeout).await
    }

    /// Acquire from a specific pool, such as the in-memory variant of an endpoint
    pub async fn acquire_from(&self, pool: Arc<EndpointPool>, timeout: Duration) -> Result<Handle, FederationError> {
        if let Some(handle) = pool.pop() {
            if pool.is_empty() {
                self.spawn_connect(pool.clone());
            }
            if handle.is_closed() {
                return Err(FederationError::StaleHandle(format!(
                    "Pooled handle {} for {} was already closed",
                    handle.id(),
                    mask_key(pool.key())
                )));
            }
            return Ok(handle);
        }

        let handle = self.connect_within(pool.clone(), timeout).await?;
        self.spawn_connect(pool);
        Ok(handle)
    }

    /// Acquire, retrying once when the pooled handle turns out to be stale
    pub async fn acquire_with_retry(
        &self,
        descriptor: &EndpointDescriptor,
        timeout: Duration,
    ) -> Result<Handle, FederationError> {
        match self.acquire(descriptor, timeout).await {
            Err(FederationError::StaleHandle(reason)) => {
                tracing::debug!("Discarding stale handle, retrying acquisition: {}", reason);
                self.acquire(descriptor, timeout).await
            }
            other => other,
        }
    }

    /// Return a handle to its pool; a rejected handle is handed back for the caller to close
    pub async fn release(&self, descriptor: &EndpointDescriptor, handle: Handle) -> Result<(), Handle> {
        self.release_keyed(&descriptor.pool_key(), handle).await
    }

    pub async fn release_keyed(&self, key: &str, handle: Handle) -> Result<(), Handle> {
        match self.get_pool(key).await {
            Some(pool) if !handle.is_closed() => pool.push(handle),
            _ => Err(handle),
        }
    }

    /// Connect with a bounded wait. A connect finishing after the caller gave up
    /// is pooled instead, or closed if the pool is full or purged.
    async fn connect_within(&self, pool: Arc<EndpointPool>, timeout: Duration) -> Result<Handle, FederationError> {
        let effective = self.effective_timeout(pool.key(), timeout);
        let (tx, rx) = oneshot::channel::<Result<Handle, FederationError>>();

        let connector = self.connector.clone();
        let late_pool = pool.clone();
        tokio::spawn(async move {
            let result = connector.connect(late_pool.descriptor()).await;
            if let Err(Ok(handle)) = tx.send(result) {
                Self::pool_or_close(&late_pool, handle);
            }
        });

        match tokio::time::timeout(effective, rx).await {
            Ok(Ok(result)) => result.map_err(|e| match e {
                FederationError::EndpointUnavailable(_) | FederationError::InvalidDescriptor(_) => e,
                other => FederationError::EndpointUnavailable(other.to_string()),
            }),
            Ok(Err(_)) => Err(FederationError::EndpointUnavailable(format!(
                "Connect task for {} ended without a result",
                mask_key(pool.key())
            ))),
            Err(_) => Err(FederationError::EndpointUnavailable(format!(
                "No handle for {} within {} ms; connecting in background",
                mask_key(pool.key()),
                effective.as_millis()
            ))),
        }
    }

    /// Connect one more handle in the background and pool it
    pub fn spawn_connect(&self, pool: Arc<EndpointPool>) {
        let connector = self.connector.clone();
        tokio::spawn(async move {
            match connector.connect(pool.descriptor()).await {
                Ok(handle) => Self::pool_or_close(&pool, handle),
                Err(e) => tracing::warn!(
                    "Asynchronous connection attempt failed for {}: {}",
                    mask_key(pool.key()),
                    e
                ),
            }
        });
    }

    fn pool_or_close(pool: &Arc<EndpointPool>, handle: Handle) {
        if let Err(handle) = pool.push(handle) {
            tracing::debug!(
                "Closing handle {} not accepted by pool {} (purged: {})",
                handle.id(),
                mask_key(pool.key()),
                pool.is_purged()
            );
            close_in_background(vec![handle]);
        }
    }

    /// Detach and remove a pool, closing its handles in a background task.
    /// Returns the number of handles scheduled for close.
    pub async fn purge(&self, key: &str) -> usize {
        let removed = self.pools.write().await.remove(key);
        self.first_attempts_guard().remove(key);
        match removed {
            Some(pool) => {
                let handles = pool.detach();
                let count = handles.len();
                tracing::info!("Purged endpoint pool {} ({} handle(s))", mask_key(key), count);
                close_in_background(handles);
                count
            }
            None => 0,
        }
    }

    /// Purge both the main and in-memory pools of a descriptor
    pub async fn purge_descriptor(&self, descriptor: &EndpointDescriptor) -> usize {
        self.purge(&descriptor.pool_key()).await + self.purge(&descriptor.in_memory_key()).await
    }

    /// Check the top idle handle of a pool; an empty or missing pool counts as valid
    pub async fn validate(&self, key: &str) -> bool {
        let Some(pool) = self.get_pool(key).await else {
            return true;
        };
        let Some(handle) = pool.peek() else {
            return true;
        };
        match handle.kind() {
            HandleKind::Relational => handle.is_valid(self.settings.validation_timeout).await,
            HandleKind::Child => match handle.reinitialise().await {
                Ok(valid) => valid,
                Err(e) => {
                    tracing::warn!("Child source for {} failed to reinitialise: {}", mask_key(key), e);
                    false
                }
            },
            HandleKind::Other => true,
        }
    }

    pub async fn pool_keys(&self) -> Vec<String> {
        self.pools.read().await.keys().cloned().collect()
    }

    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }

    pub async fn statuses(&self) -> Vec<PoolStatus> {
        let pools = self.pools.read().await;
        let mut statuses: Vec<PoolStatus> = pools.values().map(|p| p.status()).collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }

    /// Replace the set of relational endpoints currently referenced by definitions
    pub fn set_referenced(&self, keys: HashSet<String>) {
        *self.referenced.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = keys;
    }

    pub fn is_referenced(&self, key: &str) -> bool {
        self.referenced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key)
    }

    /// Ensure a pool exists and start one background connect if it is empty
    pub async fn prime(&self, descriptor: &EndpointDescriptor) {
        let pool = self.get_or_create_pool(descriptor).await;
        if pool.is_empty() {
            tracing::debug!("Priming endpoint pool {}", descriptor);
            self.spawn_connect(pool);
        }
    }

    /// Close every pooled handle, waiting for each, and collect the failures
    pub async fn close_all(&self) -> Vec<String> {
        let pools: Vec<Arc<EndpointPool>> = {
            let mut map = self.pools.write().await;
            map.drain().map(|(_, pool)| pool).collect()
        };
        self.first_attempts_guard().clear();

        let timeout = self.settings.validation_timeout;
        let closes = pools.iter().flat_map(|pool| {
            let key = mask_key(pool.key());
            pool.detach().into_iter().map(move |handle| {
                let key = key.clone();
                async move {
                    match tokio::time::timeout(timeout, handle.close()).await {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(format!("{} handle {}: {}", key, handle.id(), e)),
                        Err(_) => Some(format!("{} handle {}: close timed out", key, handle.id())),
                    }
                }
            })
        });
        futures::future::join_all(closes).await.into_iter().flatten().collect()
    }
}

/// Close handles off the caller's path; failures are only logged
pub fn close_in_background(handles: Vec<Handle>) {
    if handles.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for handle in handles {
            if let Err(e) = handle.close().await {
                tracing::warn!("Failed to close handle {}: {}", handle.id(), e);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::connectors::SourceHandle;
    use crate::services::testing::{leaf, MockBehaviour, MockConnector};

    fn manager(mock: &MockConnector) -> EndpointPoolManager {
        EndpointPoolManager::with_settings(
            Arc::new(mock.clone()),
            PoolSettings {
                max_size: 2,
                first_connect_grace: Duration::from_millis(300),
                ..PoolSettings::default()
            },
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_acquire_release_round_trip_restores_size() {
        let mock = MockConnector::new();
        let pools = manager(&mock);
        let d = leaf("a");

        let handle = pools.acquire(&d, MIN_CONNECT_TIMEOUT).await.unwrap();
        settle().await;
        // the spare connected after the first acquire
        let pool = pools.get_pool(&d.pool_key()).await.unwrap();
        assert_eq!(pool.size(), 1);

        assert!(pools.release(&d, handle).await.is_ok());
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn test_push_rejected_when_full() {
        let mock = MockConnector::new();
        let pools = manager(&mock);
        let d = leaf("a");
        let pool = pools.get_or_create_pool(&d).await;

        let connector = mock.clone();
        for _ in 0..2 {
            assert!(pool.push(connector.connect(&d).await.unwrap()).is_ok());
        }
        let extra = connector.connect(&d).await.unwrap();
        let rejected = pool.push(extra.clone()).unwrap_err();
        assert_eq!(rejected.id(), extra.id());
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.max_observed(), 2);
    }

    #[tokio::test]
    async fn test_first_handle_and_history_cleared_by_purge() {
        let mock = MockConnector::new();
        let pools = manager(&mock);
        let d = leaf("a");
        let pool = pools.get_or_create_pool(&d).await;

        let first = mock.connect(&d).await.unwrap();
        let first_id = first.id();
        pool.push(first).unwrap();
        pool.push(mock.connect(&d).await.unwrap()).unwrap();
        assert_eq!(pool.first_handle_id(), Some(first_id));

        assert_eq!(pools.purge(&d.pool_key()).await, 2);
        assert!(pools.get_pool(&d.pool_key()).await.is_none());
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.max_observed(), 0);
        assert_eq!(pool.first_handle_id(), None);
    }

    #[tokio::test]
    async fn test_purge_closes_handles_even_when_close_fails() {
        let mock = MockConnector::new();
        let pools = manager(&mock);
        let d = leaf("a");
        mock.set(&d, MockBehaviour { close_fails: true, ..Default::default() });

        let pool = pools.get_or_create_pool(&d).await;
        pool.push(mock.connect(&d).await.unwrap()).unwrap();
        pool.push(mock.connect(&d).await.unwrap()).unwrap();

        pools.purge(&d.pool_key()).await;
        settle().await;
        assert_eq!(pool.size(), 0);
        assert!(pools.get_pool(&d.pool_key()).await.is_none());
        assert_eq!(mock.closed_count(), 2);
    }

    #[tokio::test]
    async fn test_handle_arriving_after_purge_is_closed() {
        let mock = MockConnector::new();
        let pools = manager(&mock);
        let d = leaf("slow");
        mock.set(&d, MockBehaviour { connect_delay: Duration::from_millis(100), ..Default::default() });

        let pool = pools.get_or_create_pool(&d).await;
        pools.spawn_connect(pool.clone());
        pools.purge(&d.pool_key()).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.size(), 0);
        let handles = mock.handles_for(&d);
        assert_eq!(handles.len(), 1);
        assert!(handles[0].is_closed());
    }

    #[tokio::test]
    async fn test_stale_handle_surfaces_then_retry_succeeds() {
        let mock = MockConnector::new();
        let pools = manager(&mock);
        let d = leaf("a");
        let pool = pools.get_or_create_pool(&d).await;

        let handle = mock.connect(&d).await.unwrap();
        pool.push(handle.clone()).unwrap();
        mock.handles_for(&d)[0].break_connection();

        assert!(matches!(
            pools.acquire(&d, MIN_CONNECT_TIMEOUT).await,
            Err(FederationError::StaleHandle(_))
        ));

        // the emptied pool started a spare
        settle().await;
        assert_eq!(pool.size(), 1);

        let stale = mock.connect(&d).await.unwrap();
        pool.push(stale.clone()).unwrap();
        stale.close().await.unwrap();
        let fresh = pools.acquire_with_retry(&d, MIN_CONNECT_TIMEOUT).await.unwrap();
        assert!(!fresh.is_closed());
        assert_ne!(fresh.id(), stale.id());
    }

    #[tokio::test]
    async fn test_slow_connect_times_out_then_lands_in_pool() {
        let mock = MockConnector::new();
        let pools = manager(&mock);
        let d = leaf("slow");
        mock.set(&d, MockBehaviour { connect_delay: Duration::from_millis(500), ..Default::default() });

        let started = Instant::now();
        let result = pools.acquire(&d, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(FederationError::EndpointUnavailable(_))));
        // the grace window stretched the 50 ms request to the 300 ms floor
        assert!(started.elapsed() >= Duration::from_millis(250));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let pool = pools.get_pool(&d.pool_key()).await.unwrap();
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_effective_timeout_after_grace_uses_request() {
        let mock = MockConnector::new();
        let pools = manager(&mock);
        let d = leaf("a");
        pools.get_or_create_pool(&d).await;

        assert_eq!(
            pools.effective_timeout(&d.pool_key(), Duration::from_millis(10)),
            Duration::from_millis(300)
        );
        tokio::time::sleep(Duration::from_millis(320)).await;
        assert_eq!(
            pools.effective_timeout(&d.pool_key(), Duration::from_millis(10)),
            Duration::from_millis(10)
        );
    }

    #[tokio::test]
    async fn test_failed_connect_is_unavailable() {
        let mock = MockConnector::new();
        let pools = manager(&mock);
        let d = leaf("down");
        mock.set(&d, MockBehaviour { connect_fails: true, ..Default::default() });

        assert!(matches!(
            pools.acquire(&d, MIN_CONNECT_TIMEOUT).await,
            Err(FederationError::EndpointUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_by_kind() {
        let mock = MockConnector::new();
        let pools = manager(&mock);
        let d = leaf("a");
        let child = EndpointDescriptor::child("mock", "x");
        mock.set(&child, MockBehaviour { kind: HandleKind::Child, ..Default::default() });

        assert!(pools.validate("missing").await);
        let pool = pools.get_or_create_pool(&d).await;
        assert!(pools.validate(&d.pool_key()).await);
        pool.push(mock.connect(&d).await.unwrap()).unwrap();
        assert!(pools.validate(&d.pool_key()).await);
        mock.update(&d, |b| b.invalid = true);
        assert!(!pools.validate(&d.pool_key()).await);

        let child_pool = pools.get_or_create_pool(&child).await;
        child_pool.push(mock.connect(&child).await.unwrap()).unwrap();
        assert!(pools.validate(&child.pool_key()).await);
        mock.update(&child, |b| b.invalid = true);
        assert!(!pools.validate(&child.pool_key()).await);
    }

    #[tokio::test]
    async fn test_close_all_reports_failures() {
        let mock = MockConnector::new();
        let pools = manager(&mock);
        let good = leaf("good");
        let bad = leaf("bad");
        mock.set(&bad, MockBehaviour { close_fails: true, ..Default::default() });

        pools.get_or_create_pool(&good).await.push(mock.connect(&good).await.unwrap()).unwrap();
        pools.get_or_create_pool(&bad).await.push(mock.connect(&bad).await.unwrap()).unwrap();

        let errors = pools.close_all().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(pools.pool_count().await, 0);
        assert_eq!(mock.closed_count(), 2);
    }

    #[test]
    fn test_status_masks_secret() {
        let d = EndpointDescriptor::relational("postgresql://h/db", Some("u"), Some("secret"));
        let pool = EndpointPool::new(d.pool_key(), d.clone(), 4);
        let status = pool.status();
        assert!(!status.key.contains("secret"));
        assert_eq!(status.max_size, 4);
        assert_eq!(status.size, 0);
    }
}
