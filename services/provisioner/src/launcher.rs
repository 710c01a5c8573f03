//! Node launch driver.
//!
//! A [`NodeLauncher`] owns one node record for the duration of its launch
//! and is ticked by the provider loop. Each tick performs at most one
//! bounded unit of work: acquiring the record lock and persisting
//! pre-launch metadata, advancing the adapter's create state machine,
//! cleaning up a failed attempt, or polling the reachability scan.
//!
//! # Invariants
//!
//! - A finished launcher reports exactly one of {Ready, Failed, Aborted}
//! - The provider handle is persisted the moment it is known, so a crash
//!   after that point can still locate and clean up the resource
//! - A quota rejection is never retried; transient failures are retried up
//!   to the provider's configured attempt count with partial-resource
//!   cleanup between attempts
//! - Lock loss aborts the in-memory operation only; the record is left for
//!   external reconciliation

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use fleet_coordination::{CoordError, Coordinator, LockHandle, Node, NodeState};
use fleet_quota::{QuotaInformation, INSTANCES};

use crate::adapter::{
    Adapter, AdapterError, CreateParams, StateMachine, NODE_METADATA_KEY, OWNER_METADATA_KEY,
};
use crate::config::{PoolLabelConfig, ProviderConfig};
use crate::scan::ScanPool;

const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

enum LaunchPhase {
    /// Lock the record, persist pre-launch metadata, build create params.
    Start,

    /// Drive the adapter's create state machine.
    Advancing,

    /// Drive a delete state machine that disposes of a failed attempt's
    /// partial resource before the next attempt.
    Recovering,

    /// Wait for the reachability scan running on the worker pool.
    Scanning,

    Done,
}

enum LaunchFailure {
    /// Provider quota rejection; terminal, never retried.
    Quota(String),

    /// Terminal failure: retries exhausted, scan failed, or coordination
    /// write failed.
    Error(String),

    /// This process no longer owns the record.
    LockLost,
}

/// Drives one node's create operation to a terminal state.
pub struct NodeLauncher {
    node: Node,
    label: PoolLabelConfig,
    provider: Arc<ProviderConfig>,
    adapter: Arc<dyn Adapter>,
    coordinator: Arc<dyn Coordinator>,
    scan_pool: ScanPool,
    launcher_id: String,

    phase: LaunchPhase,
    machine: Option<Box<dyn StateMachine>>,
    params: Option<CreateParams>,
    scan_rx: Option<oneshot::Receiver<Result<Vec<String>>>>,
    lock: Option<LockHandle>,
    started: Instant,
    attempts: u32,
    result: Option<NodeState>,
}

impl NodeLauncher {
    pub fn new(
        node: Node,
        label: PoolLabelConfig,
        provider: Arc<ProviderConfig>,
        adapter: Arc<dyn Adapter>,
        coordinator: Arc<dyn Coordinator>,
        scan_pool: ScanPool,
        launcher_id: String,
    ) -> Self {
        Self {
            node,
            label,
            provider,
            adapter,
            coordinator,
            scan_pool,
            launcher_id,
            phase: LaunchPhase::Start,
            machine: None,
            params: None,
            scan_rx: None,
            lock: None,
            started: Instant::now(),
            attempts: 0,
            result: None,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Terminal state, once finished: Ready, Failed, or Aborted.
    pub fn result(&self) -> Option<NodeState> {
        self.result
    }

    /// Advance the launch by one unit of work. Returns true once finished.
    pub async fn tick(&mut self) -> bool {
        if matches!(self.phase, LaunchPhase::Done) {
            return true;
        }

        if self.started.elapsed() >= self.provider.launch_timeout() {
            warn!(
                node_id = self.node.id,
                elapsed_secs = self.started.elapsed().as_secs(),
                "Launch timed out"
            );
            self.fail(NodeState::Failed).await;
            return true;
        }

        match self.step().await {
            Ok(()) => matches!(self.phase, LaunchPhase::Done),
            Err(LaunchFailure::Quota(reason)) => {
                warn!(node_id = self.node.id, reason = %reason, "Launch rejected for quota");
                self.fail(NodeState::Aborted).await;
                true
            }
            Err(LaunchFailure::Error(reason)) => {
                warn!(node_id = self.node.id, reason = %reason, "Launch failed");
                self.fail(NodeState::Failed).await;
                true
            }
            Err(LaunchFailure::LockLost) => {
                warn!(
                    node_id = self.node.id,
                    "Lock lost during launch; leaving record for reconciliation"
                );
                self.lock = None;
                self.result = Some(NodeState::Failed);
                self.phase = LaunchPhase::Done;
                true
            }
        }
    }

    async fn step(&mut self) -> Result<(), LaunchFailure> {
        match self.phase {
            LaunchPhase::Start => self.start().await,
            LaunchPhase::Advancing => self.advance_machine().await,
            LaunchPhase::Recovering => self.advance_cleanup().await,
            LaunchPhase::Scanning => self.poll_scan().await,
            LaunchPhase::Done => Ok(()),
        }
    }

    /// First tick: claim the record, persist pre-launch metadata, and
    /// prepare the create parameters.
    async fn start(&mut self) -> Result<(), LaunchFailure> {
        let lock = self
            .coordinator
            .lock_node(self.node.id, &self.launcher_id, LOCK_ACQUIRE_TIMEOUT)
            .await
            .map_err(|e| LaunchFailure::Error(format!("failed to lock node: {e}")))?;
        self.lock = Some(lock);

        self.node.hostname = format!("{}-{:07}", self.label.name, self.node.id);
        if self.node.quota.is_none() {
            self.node.quota = Some(self.required_quota().await);
        }
        self.node.set_state(NodeState::Building);
        self.persist().await?;

        let mut metadata = HashMap::new();
        metadata.insert(
            OWNER_METADATA_KEY.to_string(),
            self.provider.name.clone(),
        );
        metadata.insert(NODE_METADATA_KEY.to_string(), self.node.id.to_string());
        self.params = Some(CreateParams {
            hostname: self.node.hostname.clone(),
            label: self.label.clone(),
            image_id: self.label.image.clone(),
            metadata,
            retries: self.provider.launch_retries,
        });

        debug!(
            node_id = self.node.id,
            hostname = %self.node.hostname,
            label = %self.label.name,
            "Launch starting"
        );
        self.phase = LaunchPhase::Advancing;
        Ok(())
    }

    /// Resources one node of this label consumes, falling back to a
    /// one-instance estimate when the adapter cannot say.
    async fn required_quota(&self) -> QuotaInformation {
        match self.adapter.label_quota(&self.label).await {
            Ok(quota) => quota,
            Err(AdapterError::NotImplemented(_)) => {
                QuotaInformation::zero().with_resource(INSTANCES, 1.0)
            }
            Err(e) => {
                warn!(label = %self.label.name, error = %e, "Label quota lookup failed");
                QuotaInformation::zero().with_resource(INSTANCES, 1.0)
            }
        }
    }

    async fn advance_machine(&mut self) -> Result<(), LaunchFailure> {
        if self.machine.is_none() {
            let params = self.params.clone().expect("params built before advancing");
            match self.adapter.create_state_machine(params).await {
                Ok(machine) => self.machine = Some(machine),
                Err(e) => return self.fail_attempt(e).await,
            }
            return Ok(());
        }

        let machine = self.machine.as_mut().expect("machine present");
        match machine.advance().await {
            Ok(finished) => {
                if self.node.external_id.is_none() {
                    if let Some(external_id) = self.machine.as_ref().and_then(|m| m.external_id())
                    {
                        self.node.external_id = Some(external_id.to_string());
                        self.persist().await?;
                    }
                }
                if let Some(instance) = finished {
                    self.copy_instance_fields(&instance);
                    self.persist().await?;
                    self.submit_scan();
                    self.machine = None;
                    self.phase = LaunchPhase::Scanning;
                }
                Ok(())
            }
            Err(e) => self.fail_attempt(e).await,
        }
    }

    /// Classify an attempt failure and set up the retry, if any remain.
    async fn fail_attempt(&mut self, error: AdapterError) -> Result<(), LaunchFailure> {
        if let AdapterError::Quota(reason) = &error {
            return Err(LaunchFailure::Quota(reason.clone()));
        }

        // Capture any handle the failed attempt managed to create.
        if self.node.external_id.is_none() {
            if let Some(external_id) = self.machine.as_ref().and_then(|m| m.external_id()) {
                self.node.external_id = Some(external_id.to_string());
                self.persist().await?;
            }
        }
        self.machine = None;

        self.attempts += 1;
        if self.attempts > self.provider.launch_retries {
            return Err(LaunchFailure::Error(format!(
                "launch failed after {} attempts: {error}",
                self.attempts
            )));
        }
        warn!(
            node_id = self.node.id,
            attempt = self.attempts,
            error = %error,
            "Launch attempt failed, retrying"
        );

        if let Some(external_id) = self.node.external_id.clone() {
            match self.adapter.delete_state_machine(&external_id).await {
                Ok(machine) => {
                    self.machine = Some(machine);
                    self.phase = LaunchPhase::Recovering;
                }
                Err(AdapterError::NotFound(_)) => {
                    self.node.external_id = None;
                    self.persist().await?;
                }
                Err(e) => {
                    return Err(LaunchFailure::Error(format!(
                        "attempt cleanup failed: {e}"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Drive the between-attempts cleanup of a partially created resource.
    async fn advance_cleanup(&mut self) -> Result<(), LaunchFailure> {
        let machine = self.machine.as_mut().expect("cleanup machine present");
        let finished = match machine.advance().await {
            Ok(_) => machine.complete(),
            Err(AdapterError::NotFound(_)) => true,
            Err(e) => {
                return Err(LaunchFailure::Error(format!(
                    "attempt cleanup failed: {e}"
                )))
            }
        };
        if finished {
            self.machine = None;
            self.node.external_id = None;
            self.persist().await?;
            self.phase = LaunchPhase::Advancing;
        }
        Ok(())
    }

    fn copy_instance_fields(&mut self, instance: &crate::adapter::Instance) {
        self.node.external_id = Some(instance.external_id.clone());
        self.node.addresses = instance.addresses.clone();
        self.node.quota = Some(instance.quota.clone());
        self.node.username = instance.username.clone();
        self.node.connection_type = instance.connection_type.clone();
        self.node.connection_port = instance.connection_port;
        self.node.shell_type = instance.shell_type.clone();
        self.node.driver_data = instance.driver_data.clone();
    }

    fn submit_scan(&mut self) {
        let host = self
            .node
            .addresses
            .first()
            .cloned()
            .unwrap_or_else(|| self.node.hostname.clone());
        let port = self.node.connection_port.unwrap_or(22);
        self.scan_rx = Some(
            self.scan_pool
                .submit(host, port, self.provider.boot_timeout()),
        );
    }

    async fn poll_scan(&mut self) -> Result<(), LaunchFailure> {
        let rx = self.scan_rx.as_mut().expect("scan submitted");
        match rx.try_recv() {
            Ok(Ok(host_keys)) => {
                self.node.host_keys = host_keys;
                self.node.set_state(NodeState::Ready);
                self.persist().await?;
                self.release_lock().await;
                self.result = Some(NodeState::Ready);
                self.phase = LaunchPhase::Done;
                info!(
                    node_id = self.node.id,
                    hostname = %self.node.hostname,
                    external_id = self.node.external_id.as_deref().unwrap_or(""),
                    elapsed_ms = self.started.elapsed().as_millis() as u64,
                    "Node ready"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(LaunchFailure::Error(format!(
                "reachability scan failed: {e}"
            ))),
            Err(oneshot::error::TryRecvError::Empty) => Ok(()),
            Err(oneshot::error::TryRecvError::Closed) => {
                Err(LaunchFailure::Error("scan worker dropped".to_string()))
            }
        }
    }

    /// Persist the node record; requires the lock we acquired at start.
    async fn persist(&self) -> Result<(), LaunchFailure> {
        let lock = self.lock.as_ref().ok_or(LaunchFailure::LockLost)?;
        self.coordinator
            .update_node(&self.node, lock)
            .await
            .map_err(|e| match e {
                CoordError::LockLost(_) => LaunchFailure::LockLost,
                other => LaunchFailure::Error(format!("coordination write failed: {other}")),
            })
    }

    /// Record the terminal failure state, best effort. The external id, if
    /// any, is preserved on the record for later cleanup.
    async fn fail(&mut self, state: NodeState) {
        self.node.set_state(state);
        if let Err(e) = self.persist().await {
            match e {
                LaunchFailure::LockLost => {}
                LaunchFailure::Error(reason) | LaunchFailure::Quota(reason) => {
                    warn!(node_id = self.node.id, reason = %reason, "Failed to record terminal state");
                }
            }
        }
        self.release_lock().await;
        self.result = Some(state);
        self.phase = LaunchPhase::Done;
    }

    async fn release_lock(&mut self) {
        if let Some(lock) = self.lock.take() {
            let _ = self.coordinator.unlock(lock).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use fleet_coordination::InMemoryCoordinator;

    use crate::mock::MockAdapter;
    use crate::scan::{ScanPool, StaticScanner};

    fn provider_config() -> Arc<ProviderConfig> {
        Arc::new(ProviderConfig {
            name: "cloud-a".to_string(),
            driver: "mock".to_string(),
            rate_ms: 10,
            launch_timeout_secs: 30,
            boot_timeout_secs: 5,
            launch_retries: 2,
            max_concurrency: None,
            pools: vec![],
        })
    }

    fn test_label() -> PoolLabelConfig {
        PoolLabelConfig {
            name: "small".to_string(),
            image: "ubuntu-noble".to_string(),
            flavor: None,
            min_ready: 0,
        }
    }

    fn scan_pool() -> ScanPool {
        ScanPool::new(
            Arc::new(StaticScanner::with_keys(vec!["ssh-ed25519 AAAA".to_string()])),
            2,
        )
    }

    async fn drive(launcher: &mut NodeLauncher) -> NodeState {
        for _ in 0..50 {
            if launcher.tick().await {
                return launcher.result().expect("terminal state set");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("launcher did not finish");
    }

    async fn new_launcher(
        adapter: &Arc<MockAdapter>,
        coordinator: &Arc<InMemoryCoordinator>,
        provider: Arc<ProviderConfig>,
    ) -> NodeLauncher {
        let node = coordinator
            .create_node(Node::new("cloud-a", "main", "small"))
            .await
            .unwrap();
        NodeLauncher::new(
            node,
            test_label(),
            provider,
            Arc::clone(adapter) as Arc<dyn crate::adapter::Adapter>,
            Arc::clone(coordinator) as Arc<dyn Coordinator>,
            scan_pool(),
            "worker-a".to_string(),
        )
    }

    #[tokio::test]
    async fn test_successful_launch_reaches_ready() {
        let adapter = Arc::new(MockAdapter::new("cloud-a"));
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let mut launcher = new_launcher(&adapter, &coordinator, provider_config()).await;

        assert_eq!(drive(&mut launcher).await, NodeState::Ready);

        let node = coordinator
            .get_node(launcher.node().id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.state, NodeState::Ready);
        assert!(node.external_id.is_some());
        assert_eq!(node.host_keys, vec!["ssh-ed25519 AAAA"]);
        assert_eq!(node.username.as_deref(), Some("ci"));
        assert!(node.hostname.starts_with("small-"));
        // The record lock is released on completion.
        assert!(!coordinator.is_node_locked(node.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_retries_then_fails() {
        let adapter = Arc::new(MockAdapter::new("cloud-a"));
        adapter.cloud().create_failures = 3;
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let mut launcher = new_launcher(&adapter, &coordinator, provider_config()).await;

        assert_eq!(drive(&mut launcher).await, NodeState::Failed);
        // First attempt plus launch_retries additional attempts.
        assert_eq!(adapter.cloud().create_attempts, 3);

        let node = coordinator
            .get_node(launcher.node().id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.state, NodeState::Failed);
    }

    #[tokio::test]
    async fn test_retry_after_transient_failure_succeeds() {
        let adapter = Arc::new(MockAdapter::new("cloud-a"));
        adapter.cloud().create_failures = 1;
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let mut launcher = new_launcher(&adapter, &coordinator, provider_config()).await;

        assert_eq!(drive(&mut launcher).await, NodeState::Ready);
        assert_eq!(adapter.cloud().create_attempts, 2);
    }

    #[tokio::test]
    async fn test_quota_rejection_aborts_without_retry() {
        let adapter = Arc::new(MockAdapter::new("cloud-a"));
        adapter.cloud().quota_failures = 1;
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let mut launcher = new_launcher(&adapter, &coordinator, provider_config()).await;

        assert_eq!(drive(&mut launcher).await, NodeState::Aborted);
        assert_eq!(adapter.cloud().create_attempts, 1);

        let node = coordinator
            .get_node(launcher.node().id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.state, NodeState::Aborted);
    }

    #[tokio::test]
    async fn test_scan_failure_fails_launch() {
        let adapter = Arc::new(MockAdapter::new("cloud-a"));
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let node = coordinator
            .create_node(Node::new("cloud-a", "main", "small"))
            .await
            .unwrap();
        let mut launcher = NodeLauncher::new(
            node,
            test_label(),
            provider_config(),
            Arc::clone(&adapter) as Arc<dyn crate::adapter::Adapter>,
            Arc::clone(&coordinator) as Arc<dyn Coordinator>,
            ScanPool::new(Arc::new(StaticScanner::failing()), 2),
            "worker-a".to_string(),
        );

        assert_eq!(drive(&mut launcher).await, NodeState::Failed);
        // The created resource's handle stays on the record for cleanup.
        let stored = coordinator
            .get_node(launcher.node().id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.external_id.is_some());
    }

    #[tokio::test]
    async fn test_lock_loss_aborts_in_memory_only() {
        let adapter = Arc::new(MockAdapter::new("cloud-a"));
        adapter.cloud().create_ticks = 5;
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let mut launcher = new_launcher(&adapter, &coordinator, provider_config()).await;

        // Let the launch get underway, then expire the session lock.
        assert!(!launcher.tick().await);
        assert!(!launcher.tick().await);
        coordinator.expire_node_lock(launcher.node().id);

        assert_eq!(drive(&mut launcher).await, NodeState::Failed);
        // The record was not force-written by the losing process.
        let stored = coordinator
            .get_node(launcher.node().id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, NodeState::Building);
    }

    #[tokio::test]
    async fn test_zero_timeout_fails_immediately() {
        let adapter = Arc::new(MockAdapter::new("cloud-a"));
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let provider = Arc::new(ProviderConfig {
            launch_timeout_secs: 0,
            ..(*provider_config()).clone()
        });
        let mut launcher = new_launcher(&adapter, &coordinator, provider).await;

        assert!(launcher.tick().await);
        assert_eq!(launcher.result(), Some(NodeState::Failed));
    }
}
