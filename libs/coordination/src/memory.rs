//! Single-process in-memory coordination backend.
//!
//! Implements the full [`Coordinator`] contract against process-local
//! maps. Used by tests, local development, and the mock driver path.
//! Test-facing knobs allow simulating a degraded connection and session
//! expiry (lost locks).

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::{
    ConnectionState, CoordError, CoordResult, Coordinator, LockHandle, Node, NodeId, NodeRequest,
    RequestId,
};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

fn node_key(id: NodeId) -> String {
    format!("nodes/{id}")
}

fn request_key(id: RequestId) -> String {
    format!("requests/{id}")
}

#[derive(Default)]
struct Inner {
    connection: Option<ConnectionState>,
    next_node_id: NodeId,
    next_request_id: RequestId,
    nodes: BTreeMap<NodeId, Node>,
    requests: BTreeMap<RequestId, NodeRequest>,
    locks: HashMap<String, String>,
    launchers: BTreeMap<String, DateTime<Utc>>,
}

impl Inner {
    fn holds(&self, lock: &LockHandle) -> bool {
        self.locks.get(lock.key()).map(String::as_str) == Some(lock.owner())
    }

    fn check_connected(&self) -> CoordResult<()> {
        match self.connection.unwrap_or(ConnectionState::Connected) {
            ConnectionState::Lost => Err(CoordError::Disconnected(ConnectionState::Lost)),
            _ => Ok(()),
        }
    }

    fn try_lock(&mut self, key: String, owner: &str) -> Option<LockHandle> {
        if self.locks.contains_key(&key) {
            return None;
        }
        self.locks.insert(key.clone(), owner.to_string());
        Some(LockHandle::new(key, owner.to_string()))
    }
}

/// In-memory [`Coordinator`] implementation.
#[derive(Default)]
pub struct InMemoryCoordinator {
    inner: Mutex<Inner>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulate a connection-state change (test knob).
    pub fn set_connection_state(&self, state: ConnectionState) {
        self.lock_inner().connection = Some(state);
    }

    /// Simulate session expiry for a node lock: the holder's handle stops
    /// being valid and guarded writes fail with `LockLost` (test knob).
    pub fn expire_node_lock(&self, id: NodeId) {
        self.lock_inner().locks.remove(&node_key(id));
    }

    /// Simulate session expiry for a request lock (test knob).
    pub fn expire_request_lock(&self, id: RequestId) {
        self.lock_inner().locks.remove(&request_key(id));
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    fn connection_state(&self) -> ConnectionState {
        self.lock_inner()
            .connection
            .unwrap_or(ConnectionState::Connected)
    }

    async fn register_launcher(&self, launcher_id: &str) -> CoordResult<()> {
        let mut inner = self.lock_inner();
        inner.check_connected()?;
        inner.launchers.insert(launcher_id.to_string(), Utc::now());
        Ok(())
    }

    async fn registered_launchers(&self) -> CoordResult<Vec<String>> {
        let inner = self.lock_inner();
        inner.check_connected()?;
        Ok(inner.launchers.keys().cloned().collect())
    }

    async fn create_node(&self, mut node: Node) -> CoordResult<Node> {
        let mut inner = self.lock_inner();
        inner.check_connected()?;
        inner.next_node_id += 1;
        node.id = inner.next_node_id;
        inner.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    async fn get_node(&self, id: NodeId) -> CoordResult<Option<Node>> {
        let inner = self.lock_inner();
        inner.check_connected()?;
        Ok(inner.nodes.get(&id).cloned())
    }

    async fn update_node(&self, node: &Node, lock: &LockHandle) -> CoordResult<()> {
        let mut inner = self.lock_inner();
        inner.check_connected()?;
        if !inner.holds(lock) {
            return Err(CoordError::LockLost(node_key(node.id)));
        }
        if !inner.nodes.contains_key(&node.id) {
            return Err(CoordError::NotFound(node_key(node.id)));
        }
        inner.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn delete_node(&self, id: NodeId, lock: LockHandle) -> CoordResult<()> {
        let mut inner = self.lock_inner();
        inner.check_connected()?;
        if !inner.holds(&lock) {
            return Err(CoordError::LockLost(node_key(id)));
        }
        inner.nodes.remove(&id);
        inner.locks.remove(lock.key());
        Ok(())
    }

    async fn list_nodes(&self) -> CoordResult<Vec<Node>> {
        let inner = self.lock_inner();
        inner.check_connected()?;
        Ok(inner.nodes.values().cloned().collect())
    }

    async fn create_request(&self, mut request: NodeRequest) -> CoordResult<NodeRequest> {
        let mut inner = self.lock_inner();
        inner.check_connected()?;
        inner.next_request_id += 1;
        request.id = inner.next_request_id;
        inner.requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn get_request(&self, id: RequestId) -> CoordResult<Option<NodeRequest>> {
        let inner = self.lock_inner();
        inner.check_connected()?;
        Ok(inner.requests.get(&id).cloned())
    }

    async fn update_request(&self, request: &NodeRequest, lock: &LockHandle) -> CoordResult<()> {
        let mut inner = self.lock_inner();
        inner.check_connected()?;
        if !inner.holds(lock) {
            return Err(CoordError::LockLost(request_key(request.id)));
        }
        if !inner.requests.contains_key(&request.id) {
            return Err(CoordError::NotFound(request_key(request.id)));
        }
        inner.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn list_requests(&self) -> CoordResult<Vec<NodeRequest>> {
        let inner = self.lock_inner();
        inner.check_connected()?;
        Ok(inner.requests.values().cloned().collect())
    }

    async fn try_lock_node(&self, id: NodeId, owner: &str) -> CoordResult<Option<LockHandle>> {
        let mut inner = self.lock_inner();
        inner.check_connected()?;
        if !inner.nodes.contains_key(&id) {
            return Err(CoordError::NotFound(node_key(id)));
        }
        Ok(inner.try_lock(node_key(id), owner))
    }

    async fn lock_node(
        &self,
        id: NodeId,
        owner: &str,
        timeout: Duration,
    ) -> CoordResult<LockHandle> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(handle) = self.try_lock_node(id, owner).await? {
                return Ok(handle);
            }
            if Instant::now() >= deadline {
                return Err(CoordError::LockContended(node_key(id)));
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    async fn try_lock_request(
        &self,
        id: RequestId,
        owner: &str,
    ) -> CoordResult<Option<LockHandle>> {
        let mut inner = self.lock_inner();
        inner.check_connected()?;
        if !inner.requests.contains_key(&id) {
            return Err(CoordError::NotFound(request_key(id)));
        }
        Ok(inner.try_lock(request_key(id), owner))
    }

    async fn is_node_locked(&self, id: NodeId) -> CoordResult<bool> {
        let inner = self.lock_inner();
        inner.check_connected()?;
        Ok(inner.locks.contains_key(&node_key(id)))
    }

    async fn unlock(&self, lock: LockHandle) -> CoordResult<()> {
        let mut inner = self.lock_inner();
        if inner.holds(&lock) {
            inner.locks.remove(lock.key());
        }
        Ok(())
    }
}
