//! Coordination service contract.
//!
//! The provisioning engine shares its view of the world with other launcher
//! processes through a coordination service: node and request records,
//! mutual-exclusion locks keyed by record id, launcher liveness
//! registration, and connection-state introspection.
//!
//! This crate defines the contract ([`Coordinator`]) plus a single-process
//! in-memory implementation ([`InMemoryCoordinator`]) used by tests, local
//! development, and the mock driver path. Production deployments supply a
//! backend for a real coordination store.
//!
//! # Invariants
//!
//! - Record ids are issued from a monotonically increasing sequence
//! - A record is written only by the process holding its lock; a process
//!   that loses its lock never force-deletes the record
//! - `connection_state()` must be polled before any batch of work

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fleet_quota::QuotaInformation;

mod memory;

pub use memory::InMemoryCoordinator;

/// Sequential id of a node record.
pub type NodeId = u64;

/// Sequential id of a node-request record.
pub type RequestId = u64;

/// Errors surfaced by a coordination backend.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The record does not exist (or no longer exists).
    #[error("record not found: {0}")]
    NotFound(String),

    /// The lock is held by another process.
    #[error("lock contended: {0}")]
    LockContended(String),

    /// This process no longer holds the lock it thought it held.
    #[error("lock lost: {0}")]
    LockLost(String),

    /// The connection to the coordination service is degraded.
    #[error("coordination connection {0:?}")]
    Disconnected(ConnectionState),

    /// Backend-specific failure.
    #[error("coordination error: {0}")]
    Internal(String),
}

pub type CoordResult<T> = Result<T, CoordError>;

/// Connection health of the coordination session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Session healthy; work may proceed.
    Connected,

    /// Session temporarily interrupted; defer work, locks may survive.
    Suspended,

    /// Session expired; all locks held by this process are gone.
    Lost,
}

/// Lifecycle state of a node record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Record created, launch not yet started.
    Init,

    /// A launcher is creating the backing resource.
    Building,

    /// Launch finished successfully; node is usable.
    Ready,

    /// Handed to a requestor.
    Used,

    /// Parked by an operator.
    Hold,

    /// A deleter is tearing the resource down.
    Deleting,

    /// Launch failed terminally.
    Failed,

    /// Launch rejected for quota before the resource existed.
    Aborted,
}

impl NodeState {
    /// Launch-terminal states a launcher must reach.
    pub fn is_launch_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Aborted)
    }

    /// States in which the node's budget is committed: the backing
    /// resource exists, may still exist, or is about to be created. These
    /// count against quota so two admissions cannot spend the same
    /// capacity.
    pub fn counts_against_quota(&self) -> bool {
        matches!(
            self,
            Self::Init
                | Self::Building
                | Self::Ready
                | Self::Used
                | Self::Hold
                | Self::Deleting
        )
    }
}

/// Lifecycle state of a node request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Unclaimed, waiting for a launcher.
    Requested,

    /// Claimed by a launcher; nodes are being prepared.
    Pending,

    /// Every requested node is ready.
    Fulfilled,

    /// Every capable launcher declined or failed the request.
    Failed,
}

/// One provisioned compute unit tracked through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub provider: String,
    pub pool: String,
    pub label: String,
    pub state: NodeState,
    pub state_time: DateTime<Utc>,
    pub hostname: String,

    /// Opaque provider handle; persisted the moment it is known so a
    /// crashed launcher can still be cleaned up after.
    pub external_id: Option<String>,

    /// Request this node was allocated to satisfy.
    pub allocated_to: Option<RequestId>,

    pub addresses: Vec<String>,
    pub host_keys: Vec<String>,

    /// Per-instance connection overrides reported by the adapter.
    pub username: Option<String>,
    pub connection_type: Option<String>,
    pub connection_port: Option<u16>,
    pub shell_type: Option<String>,

    /// Resource budget this node consumes, snapshotted at admission.
    pub quota: Option<QuotaInformation>,

    /// Driver-opaque payload round-tripped for the adapter.
    pub driver_data: Option<serde_json::Value>,
}

impl Node {
    /// A fresh record in `Init` with no id assigned yet.
    pub fn new(provider: &str, pool: &str, label: &str) -> Self {
        Self {
            id: 0,
            provider: provider.to_string(),
            pool: pool.to_string(),
            label: label.to_string(),
            state: NodeState::Init,
            state_time: Utc::now(),
            hostname: String::new(),
            external_id: None,
            allocated_to: None,
            addresses: Vec::new(),
            host_keys: Vec::new(),
            username: None,
            connection_type: None,
            connection_port: None,
            shell_type: None,
            quota: None,
            driver_data: None,
        }
    }

    /// Transition to a new state, stamping the transition time.
    pub fn set_state(&mut self, state: NodeState) {
        self.state = state;
        self.state_time = Utc::now();
    }
}

/// A request for one or more nodes, atomically fulfilled or failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRequest {
    pub id: RequestId,
    pub state: RequestState,
    pub state_time: DateTime<Utc>,

    /// Ordered list of requested label types.
    pub labels: Vec<String>,

    /// Launcher ids that could not serve this request.
    pub declined_by: Vec<String>,

    /// Node ids assigned on fulfillment, in label order.
    pub nodes: Vec<NodeId>,

    pub requestor: String,
}

impl NodeRequest {
    pub fn new(requestor: &str, labels: Vec<String>) -> Self {
        Self {
            id: 0,
            state: RequestState::Requested,
            state_time: Utc::now(),
            labels,
            declined_by: Vec::new(),
            nodes: Vec::new(),
            requestor: requestor.to_string(),
        }
    }

    pub fn set_state(&mut self, state: RequestState) {
        self.state = state;
        self.state_time = Utc::now();
    }
}

/// Proof that this process holds a record's lock.
///
/// Locks are released explicitly with [`Coordinator::unlock`]; a handle
/// that outlives its session is detected at the next guarded write, which
/// fails with [`CoordError::LockLost`].
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    owner: String,
}

impl LockHandle {
    pub(crate) fn new(key: String, owner: String) -> Self {
        Self { key, owner }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

/// The coordination service as consumed by the provisioning engine.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Connection health; callers must poll this before doing work.
    fn connection_state(&self) -> ConnectionState;

    /// Record (or refresh) a launcher's liveness registration.
    async fn register_launcher(&self, launcher_id: &str) -> CoordResult<()>;

    /// All launchers currently registered as live.
    async fn registered_launchers(&self) -> CoordResult<Vec<String>>;

    /// Persist a new node record, assigning it the next sequential id.
    async fn create_node(&self, node: Node) -> CoordResult<Node>;

    async fn get_node(&self, id: NodeId) -> CoordResult<Option<Node>>;

    /// Write a node record. Requires the node's lock.
    async fn update_node(&self, node: &Node, lock: &LockHandle) -> CoordResult<()>;

    /// Remove a node record. Requires the node's lock, which is consumed.
    async fn delete_node(&self, id: NodeId, lock: LockHandle) -> CoordResult<()>;

    async fn list_nodes(&self) -> CoordResult<Vec<Node>>;

    /// Persist a new request record, assigning it the next sequential id.
    async fn create_request(&self, request: NodeRequest) -> CoordResult<NodeRequest>;

    async fn get_request(&self, id: RequestId) -> CoordResult<Option<NodeRequest>>;

    /// Write a request record. Requires the request's lock.
    async fn update_request(&self, request: &NodeRequest, lock: &LockHandle) -> CoordResult<()>;

    async fn list_requests(&self) -> CoordResult<Vec<NodeRequest>>;

    /// Non-blocking lock attempt; `Ok(None)` when contended.
    async fn try_lock_node(&self, id: NodeId, owner: &str) -> CoordResult<Option<LockHandle>>;

    /// Blocking lock attempt, bounded by `timeout`.
    async fn lock_node(
        &self,
        id: NodeId,
        owner: &str,
        timeout: Duration,
    ) -> CoordResult<LockHandle>;

    /// Non-blocking lock attempt; `Ok(None)` when contended.
    async fn try_lock_request(
        &self,
        id: RequestId,
        owner: &str,
    ) -> CoordResult<Option<LockHandle>>;

    /// Whether the given node is currently locked by any process.
    async fn is_node_locked(&self, id: NodeId) -> CoordResult<bool>;

    /// Release a lock. Releasing an already-lost lock is a no-op.
    async fn unlock(&self, lock: LockHandle) -> CoordResult<()>;
}
