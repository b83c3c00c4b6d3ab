use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

use crate::models::{PeerConnection, WRONG_DIRECTION_MESSAGE};

/// Peer discovery and maintenance-direction bookkeeping consumed by the core
pub trait Discovery: Send + Sync {
    /// Peers to federate with: the defined ones followed by discovered ones
    fn current_peers(&self, defined: &[PeerConnection]) -> Vec<PeerConnection>;

    fn is_discovered_connection(&self, connection_id: &str) -> bool;

    /// Forget a discovered peer; returns false when it was not known
    fn lost_discovered_connection(&self, connection_id: &str) -> bool;

    /// Hand maintenance of a connection over to the peer; true when the hand-over took
    fn reverse_maintenance_direction_to_incoming(&self, connection_id: &str) -> bool;

    /// One-shot flag asking the next refresh to reload every table
    fn test_and_clear_config_reload_required(&self) -> bool;

    /// Server side of the handshake; `Some(reason)` rejects the sender
    fn validate_incoming_maintenance(&self, sender_node_id: &str) -> Option<String>;

    fn register_incoming(&self, sender_node_id: &str);

    fn distance_to_server(&self) -> i32;

    /// Offer a path to a full-capability node reported `distance` hops from `via_node`
    fn offer_path_to_server(&self, distance: i32, via_node: &str) -> bool;
}

/// Shortest known path to a full-capability node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPath {
    pub distance: i32,
    pub via: Option<String>,
    full_capability: bool,
}

impl ServerPath {
    pub fn new(lite: bool) -> Self {
        Self {
            distance: if lite { -1 } else { 0 },
            via: None,
            full_capability: !lite,
        }
    }

    /// Adopt `distance + 1` via the node when it beats what is known
    pub fn offer(&mut self, distance: i32, via_node: &str) -> bool {
        if self.full_capability || distance <= -1 {
            return false;
        }
        let candidate = distance + 1;
        if self.distance == -1 || candidate < self.distance {
            tracing::debug!("Path to server now {} hop(s) via {}", candidate, via_node);
            self.distance = candidate;
            self.via = Some(via_node.to_string());
            return true;
        }
        false
    }

    pub fn invalidate_via(&mut self, node_id: &str) -> bool {
        if self.via.as_deref() == Some(node_id) {
            tracing::info!("Lost path to server through {}", node_id);
            self.distance = -1;
            self.via = None;
            return true;
        }
        false
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process discovery state: discovered peers, connection directions and the server path
pub struct PeerDirectory {
    discovered: RwLock<Vec<PeerConnection>>,
    outgoing: Mutex<HashSet<String>>,
    incoming: Mutex<HashSet<String>>,
    reload_required: AtomicBool,
    server_path: Mutex<ServerPath>,
}

impl PeerDirectory {
    pub fn new(lite: bool) -> Self {
        Self {
            discovered: RwLock::new(Vec::new()),
            outgoing: Mutex::new(HashSet::new()),
            incoming: Mutex::new(HashSet::new()),
            reload_required: AtomicBool::new(false),
            server_path: Mutex::new(ServerPath::new(lite)),
        }
    }

    /// Record a discovered peer; `outgoing` when this node maintains the connection
    pub fn add_discovered(&self, mut peer: PeerConnection, outgoing: bool) -> bool {
        peer.discovered = true;
        let node_id = peer.node_id().to_string();
        let mut discovered = self.discovered.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if discovered.iter().any(|p| p.id == peer.id) {
            return false;
        }
        tracing::info!("Discovered peer {} ({})", peer.id, peer.endpoint);
        discovered.push(peer);
        if outgoing {
            lock(&self.outgoing).insert(node_id);
        }
        true
    }

    pub fn discovered_peers(&self) -> Vec<PeerConnection> {
        self.discovered
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn node_id_of(&self, connection_id: &str) -> Option<String> {
        self.discovered
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|p| p.id == connection_id)
            .map(|p| p.node_id().to_string())
    }

    pub fn is_outgoing(&self, node_id: &str) -> bool {
        lock(&self.outgoing).contains(node_id)
    }

    pub fn is_incoming(&self, node_id: &str) -> bool {
        lock(&self.incoming).contains(node_id)
    }

    pub fn request_config_reload(&self) {
        self.reload_required.store(true, Ordering::Release);
    }

    pub fn server_path(&self) -> ServerPath {
        lock(&self.server_path).clone()
    }
}

impl Discovery for PeerDirectory {
    fn current_peers(&self, defined: &[PeerConnection]) -> Vec<PeerConnection> {
        let mut peers: Vec<PeerConnection> = defined.to_vec();
        for peer in self.discovered_peers() {
            if !peers.iter().any(|p| p.id == peer.id) {
                peers.push(peer);
            }
        }
        peers
    }

    fn is_discovered_connection(&self, connection_id: &str) -> bool {
        self.node_id_of(connection_id).is_some()
    }

    fn lost_discovered_connection(&self, connection_id: &str) -> bool {
        let removed = {
            let mut discovered = self.discovered.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            let position = discovered.iter().position(|p| p.id == connection_id);
            position.map(|i| discovered.remove(i))
        };
        match removed {
            Some(peer) => {
                tracing::info!("Lost discovered peer {}", connection_id);
                let node_id = peer.node_id().to_string();
                lock(&self.outgoing).remove(&node_id);
                lock(&self.server_path).invalidate_via(&node_id);
                true
            }
            None => false,
        }
    }

    fn reverse_maintenance_direction_to_incoming(&self, connection_id: &str) -> bool {
        let Some(node_id) = self.node_id_of(connection_id) else {
            return false;
        };
        let reversed = lock(&self.outgoing).remove(&node_id);
        if reversed {
            tracing::info!("Maintenance of {} handed over to the peer", connection_id);
            lock(&self.incoming).insert(node_id);
        }
        reversed
    }

    fn test_and_clear_config_reload_required(&self) -> bool {
        self.reload_required.swap(false, Ordering::AcqRel)
    }

    fn validate_incoming_maintenance(&self, sender_node_id: &str) -> Option<String> {
        if self.is_outgoing(sender_node_id) {
            return Some(WRONG_DIRECTION_MESSAGE.to_string());
        }
        None
    }

    fn register_incoming(&self, sender_node_id: &str) {
        if lock(&self.incoming).insert(sender_node_id.to_string()) {
            tracing::info!("Registered incoming maintenance from {}", sender_node_id);
        }
    }

    fn distance_to_server(&self) -> i32 {
        lock(&self.server_path).distance
    }

    fn offer_path_to_server(&self, distance: i32, via_node: &str) -> bool {
        lock(&self.server_path).offer(distance, via_node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::peer;

    #[test]
    fn test_lite_node_adopts_shorter_path() {
        let directory = PeerDirectory::new(true);
        assert_eq!(directory.distance_to_server(), -1);

        assert!(directory.offer_path_to_server(2, "n2"));
        assert_eq!(directory.distance_to_server(), 3);
        assert!(!directory.offer_path_to_server(-1, "n3"));
        assert!(!directory.offer_path_to_server(4, "n3"));
        assert!(directory.offer_path_to_server(0, "n4"));
        assert_eq!(directory.distance_to_server(), 1);
        assert_eq!(directory.server_path().via.as_deref(), Some("n4"));
    }

    #[test]
    fn test_full_capability_node_stays_at_zero() {
        let directory = PeerDirectory::new(false);
        assert!(!directory.offer_path_to_server(0, "n2"));
        assert_eq!(directory.distance_to_server(), 0);
    }

    #[test]
    fn test_losing_via_peer_resets_distance() {
        let directory = PeerDirectory::new(true);
        directory.add_discovered(peer("n2"), true);
        directory.offer_path_to_server(0, "n2");
        assert_eq!(directory.distance_to_server(), 1);

        assert!(directory.lost_discovered_connection("n2"));
        assert_eq!(directory.distance_to_server(), -1);
        assert!(!directory.is_discovered_connection("n2"));
        assert!(!directory.lost_discovered_connection("n2"));
    }

    #[test]
    fn test_direction_checks() {
        let directory = PeerDirectory::new(false);
        directory.add_discovered(peer("n2"), true);
        assert_eq!(
            directory.validate_incoming_maintenance("n2").as_deref(),
            Some(WRONG_DIRECTION_MESSAGE)
        );
        assert!(directory.validate_incoming_maintenance("n3").is_none());

        assert!(directory.reverse_maintenance_direction_to_incoming("n2"));
        assert!(directory.is_incoming("n2"));
        assert!(directory.validate_incoming_maintenance("n2").is_none());
        assert!(!directory.reverse_maintenance_direction_to_incoming("n2"));
    }

    #[test]
    fn test_current_peers_merges_defined_first() {
        let directory = PeerDirectory::new(false);
        directory.add_discovered(peer("n3"), false);
        directory.add_discovered(peer("n2"), false);
        assert!(!directory.add_discovered(peer("n2"), false));

        let ids: Vec<String> = directory.current_peers(&[peer("n2")]).into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["n2", "n3"]);
    }

    #[test]
    fn test_reload_flag_is_one_shot() {
        let directory = PeerDirectory::new(false);
        assert!(!directory.test_and_clear_config_reload_required());
        directory.request_config_reload();
        assert!(directory.test_and_clear_config_reload_required());
        assert!(!directory.test_and_clear_config_reload_required());
    }
}
