//! Admission-controlled request handling.
//!
//! A [`RequestHandler`] owns one claimed node request: it decides whether
//! the request can proceed now (launch every node), must pause (quota
//! shortfall), or must be declined (labels this pool cannot serve), then
//! polls its nodes until all are launch-terminal.
//!
//! A request is atomic across its label list: if any node fails, every
//! node of the attempt is torn down and the request is either requeued for
//! another launcher or failed once all registered launchers have declined
//! it.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use fleet_coordination::{
    Coordinator, LockHandle, Node, NodeId, NodeRequest, NodeState, RequestState,
};

use crate::admission::AdmissionControl;
use crate::config::{PoolConfig, ProviderConfig};
use crate::provider::ProviderHandle;

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nodes are launching; poll until complete.
    Accepted,

    /// Quota shortfall; the worker retains the handler and retries.
    Paused,

    /// This worker cannot serve the request; it was requeued or failed.
    Declined,
}

/// Result of polling an accepted handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerPoll {
    Pending,
    Complete,
}

/// Drives one node request from claim to fulfillment or failure.
pub struct RequestHandler {
    request: NodeRequest,
    lock: Option<LockHandle>,
    launcher_id: String,
    provider: Arc<ProviderConfig>,
    pool: Arc<PoolConfig>,
    coordinator: Arc<dyn Coordinator>,
    provider_handle: ProviderHandle,
    node_ids: Vec<NodeId>,
    launched: bool,
}

impl RequestHandler {
    pub fn new(
        request: NodeRequest,
        lock: LockHandle,
        launcher_id: String,
        provider: Arc<ProviderConfig>,
        pool: Arc<PoolConfig>,
        coordinator: Arc<dyn Coordinator>,
        provider_handle: ProviderHandle,
    ) -> Self {
        Self {
            request,
            lock: Some(lock),
            launcher_id,
            provider,
            pool,
            coordinator,
            provider_handle,
            node_ids: Vec::new(),
            launched: false,
        }
    }

    pub fn request(&self) -> &NodeRequest {
        &self.request
    }

    pub fn node_ids(&self) -> &[NodeId] {
        &self.node_ids
    }

    /// First admission attempt for a freshly claimed request.
    pub async fn run(&mut self, admission: &mut AdmissionControl) -> Result<RunOutcome> {
        self.attempt(admission).await
    }

    /// Re-attempt admission for a paused request.
    ///
    /// A config change may have made the request permanently
    /// unsatisfiable since it was paused; that declines it instead of
    /// pausing forever.
    pub async fn retry(&mut self, admission: &mut AdmissionControl) -> Result<RunOutcome> {
        self.attempt(admission).await
    }

    async fn attempt(&mut self, admission: &mut AdmissionControl) -> Result<RunOutcome> {
        if !self.pool.supports_labels(&self.request.labels) {
            self.decline("pool does not offer the requested labels")
                .await?;
            return Ok(RunOutcome::Declined);
        }

        let labels: Vec<_> = self
            .request
            .labels
            .iter()
            .map(|name| self.pool.label(name).expect("label support checked"))
            .collect();
        let needed = admission.needed_for_labels(&labels).await;

        if !admission.has_remaining_quota(&needed).await? {
            if self.request.state != RequestState::Pending {
                self.request.set_state(RequestState::Pending);
                self.update_request().await?;
            }
            debug!(
                request_id = self.request.id,
                needed = %needed,
                "Insufficient quota, pausing"
            );
            return Ok(RunOutcome::Paused);
        }

        self.launch_nodes(admission).await?;
        Ok(RunOutcome::Accepted)
    }

    /// Create and dispatch one node per requested label.
    async fn launch_nodes(&mut self, admission: &mut AdmissionControl) -> Result<()> {
        self.request.set_state(RequestState::Pending);
        self.update_request().await?;

        for label_name in self.request.labels.clone() {
            let label = self
                .pool
                .label(&label_name)
                .expect("label support checked")
                .clone();
            let mut node = Node::new(&self.provider.name, &self.pool.name, &label_name);
            node.allocated_to = Some(self.request.id);
            // Snapshot the budget immediately so admission for later
            // requests sees this node as committed.
            node.quota = Some(admission.label_quota(&label).await);
            let node = self
                .coordinator
                .create_node(node)
                .await
                .context("node record creation failed")?;
            self.node_ids.push(node.id);
            self.provider_handle.launch(node, label);
        }
        self.launched = true;

        info!(
            request_id = self.request.id,
            labels = ?self.request.labels,
            nodes = ?self.node_ids,
            "Request accepted"
        );
        Ok(())
    }

    /// Check the assigned nodes; finish the request when all are
    /// launch-terminal.
    pub async fn poll(&mut self) -> Result<HandlerPoll> {
        if !self.launched {
            return Ok(HandlerPoll::Pending);
        }

        let mut nodes = Vec::with_capacity(self.node_ids.len());
        for id in &self.node_ids {
            match self.coordinator.get_node(*id).await? {
                Some(node) => nodes.push(node),
                // A vanished record counts as a failed node.
                None => {
                    warn!(request_id = self.request.id, node_id = *id, "Node record vanished");
                }
            }
        }

        let vanished = nodes.len() < self.node_ids.len();
        if !vanished && nodes.iter().any(|n| !n.state.is_launch_terminal()) {
            return Ok(HandlerPoll::Pending);
        }

        if !vanished && nodes.iter().all(|n| n.state == NodeState::Ready) {
            self.fulfill().await?;
            return Ok(HandlerPoll::Complete);
        }

        let had_failure =
            vanished || nodes.iter().any(|n| n.state == NodeState::Failed);

        // Partial success is not permitted: tear down the whole attempt,
        // ready and aborted nodes alike.
        for node in nodes {
            self.provider_handle.delete(node);
        }
        self.node_ids.clear();
        self.launched = false;

        self.finish_failed_attempt(had_failure).await?;
        Ok(HandlerPoll::Complete)
    }

    async fn fulfill(&mut self) -> Result<()> {
        self.request.nodes = self.node_ids.clone();
        self.request.set_state(RequestState::Fulfilled);
        self.update_request().await?;
        self.release_lock().await;
        info!(
            request_id = self.request.id,
            nodes = ?self.request.nodes,
            "Request fulfilled"
        );
        Ok(())
    }

    /// A launch attempt failed. Quota aborts requeue the request without a
    /// decline (capacity may free up); real failures decline it.
    async fn finish_failed_attempt(&mut self, had_failure: bool) -> Result<()> {
        if had_failure {
            self.decline("node launch failed").await
        } else {
            self.requeue().await
        }
    }

    /// Hand the request back for a later attempt, unlocked.
    async fn requeue(&mut self) -> Result<()> {
        warn!(
            request_id = self.request.id,
            "Launch aborted for quota, requeueing request"
        );
        self.request.set_state(RequestState::Requested);
        self.update_request().await?;
        self.release_lock().await;
        Ok(())
    }

    /// Record that this worker cannot serve the request. When every
    /// registered launcher has declined it, the request fails outright.
    async fn decline(&mut self, reason: &str) -> Result<()> {
        warn!(
            request_id = self.request.id,
            launcher_id = %self.launcher_id,
            reason,
            "Declining request"
        );
        if !self.request.declined_by.contains(&self.launcher_id) {
            self.request.declined_by.push(self.launcher_id.clone());
        }

        let launchers = self
            .coordinator
            .registered_launchers()
            .await
            .context("launcher listing failed")?;
        let all_declined = !launchers.is_empty()
            && launchers
                .iter()
                .all(|l| self.request.declined_by.contains(l));
        if all_declined {
            self.request.set_state(RequestState::Failed);
        } else {
            self.request.set_state(RequestState::Requested);
        }

        self.update_request().await?;
        self.release_lock().await;
        Ok(())
    }

    async fn update_request(&self) -> Result<()> {
        let lock = self.lock.as_ref().context("request lock released early")?;
        self.coordinator
            .update_request(&self.request, lock)
            .await
            .context("request write failed")
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

    use std::collections::HashMap;

    use fleet_coordination::InMemoryCoordinator;
    use fleet_quota::{QuotaInformation, CORES};

    use crate::config::PoolLabelConfig;
    use crate::mock::MockAdapter;
    use crate::provider::ProviderWorker;
    use crate::scan::{ScanPool, StaticScanner};

    fn provider_config() -> Arc<ProviderConfig> {
        Arc::new(ProviderConfig {
            name: "cloud-a".to_string(),
            driver: "mock".to_string(),
            rate_ms: 10,
            launch_timeout_secs: 30,
            boot_timeout_secs: 5,
            launch_retries: 1,
            max_concurrency: None,
            pools: vec![],
        })
    }

    fn pool_config() -> Arc<PoolConfig> {
        Arc::new(PoolConfig {
            name: "main".to_string(),
            max_cores: None,
            max_servers: None,
            max_ram: None,
            max_resources: HashMap::new(),
            labels: vec![
                PoolLabelConfig {
                    name: "small".to_string(),
                    image: "ubuntu-noble".to_string(),
                    flavor: None,
                    min_ready: 0,
                },
                PoolLabelConfig {
                    name: "large".to_string(),
                    image: "ubuntu-noble".to_string(),
                    flavor: None,
                    min_ready: 0,
                },
            ],
        })
    }

    struct Fixture {
        adapter: Arc<MockAdapter>,
        coordinator: Arc<InMemoryCoordinator>,
        worker: ProviderWorker,
        admission: AdmissionControl,
        handle: crate::provider::ProviderHandle,
    }

    fn fixture() -> Fixture {
        let adapter = Arc::new(MockAdapter::new("cloud-a"));
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let (worker, handle) = ProviderWorker::new(
            provider_config(),
            Arc::clone(&adapter) as Arc<dyn crate::adapter::Adapter>,
            Arc::clone(&coordinator) as Arc<dyn Coordinator>,
            ScanPool::new(
                Arc::new(StaticScanner::with_keys(vec!["key".to_string()])),
                2,
            ),
            "worker-a".to_string(),
        );
        let admission = AdmissionControl::new(
            provider_config(),
            pool_config(),
            Arc::clone(&adapter) as Arc<dyn crate::adapter::Adapter>,
            Arc::clone(&coordinator) as Arc<dyn Coordinator>,
        );
        Fixture {
            adapter,
            coordinator,
            worker,
            admission,
            handle,
        }
    }

    async fn claimed_handler(fixture: &Fixture, labels: Vec<&str>) -> RequestHandler {
        fixture.coordinator.register_launcher("worker-a").await.unwrap();
        let request = fixture
            .coordinator
            .create_request(NodeRequest::new(
                "zuul",
                labels.into_iter().map(String::from).collect(),
            ))
            .await
            .unwrap();
        let lock = fixture
            .coordinator
            .try_lock_request(request.id, "worker-a")
            .await
            .unwrap()
            .unwrap();
        RequestHandler::new(
            request,
            lock,
            "worker-a".to_string(),
            provider_config(),
            pool_config(),
            Arc::clone(&fixture.coordinator) as Arc<dyn Coordinator>,
            fixture.handle.clone(),
        )
    }

    async fn drive_worker(fixture: &mut Fixture) {
        for _ in 0..100 {
            fixture.worker.drain_commands();
            fixture.worker.advance_all().await;
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_accept_creates_one_node_per_label() {
        let mut fixture = fixture();
        let mut handler = claimed_handler(&fixture, vec!["small", "large"]).await;

        let outcome = handler.run(&mut fixture.admission).await.unwrap();
        assert_eq!(outcome, RunOutcome::Accepted);
        assert_eq!(handler.node_ids().len(), 2);

        let request = fixture
            .coordinator
            .get_request(handler.request().id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.state, RequestState::Pending);

        for id in handler.node_ids() {
            let node = fixture.coordinator.get_node(*id).await.unwrap().unwrap();
            assert_eq!(node.allocated_to, Some(handler.request().id));
            assert!(node.quota.is_some());
        }
    }

    #[tokio::test]
    async fn test_fulfillment_when_all_nodes_ready() {
        let mut fixture = fixture();
        let mut handler = claimed_handler(&fixture, vec!["small", "large"]).await;
        handler.run(&mut fixture.admission).await.unwrap();

        drive_worker(&mut fixture).await;

        assert_eq!(handler.poll().await.unwrap(), HandlerPoll::Complete);
        let request = fixture
            .coordinator
            .get_request(handler.request().id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.state, RequestState::Fulfilled);
        assert_eq!(request.nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_quota_shortfall_pauses() {
        let mut fixture = fixture();
        fixture.adapter.cloud().limits =
            QuotaInformation::unlimited().with_resource(CORES, 8.0);
        fixture.adapter.cloud().label_quotas.insert(
            "small".to_string(),
            QuotaInformation::zero().with_resource(CORES, 8.0),
        );

        let mut first = claimed_handler(&fixture, vec!["small"]).await;
        assert_eq!(
            first.run(&mut fixture.admission).await.unwrap(),
            RunOutcome::Accepted
        );

        let mut second = claimed_handler(&fixture, vec!["small"]).await;
        assert_eq!(
            second.run(&mut fixture.admission).await.unwrap(),
            RunOutcome::Paused
        );
        // The paused request stays claimed and pending.
        let request = fixture
            .coordinator
            .get_request(second.request().id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.state, RequestState::Pending);

        // Capacity frees up once the first request's node is gone.
        for id in first.node_ids().to_vec() {
            let lock = fixture
                .coordinator
                .lock_node(id, "test", std::time::Duration::from_secs(1))
                .await
                .unwrap();
            fixture.coordinator.delete_node(id, lock).await.unwrap();
        }
        assert_eq!(
            second.retry(&mut fixture.admission).await.unwrap(),
            RunOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn test_unsupported_label_declines_to_failed() {
        let mut fixture = fixture();
        let mut handler = claimed_handler(&fixture, vec!["gpu-monster"]).await;

        let outcome = handler.run(&mut fixture.admission).await.unwrap();
        assert_eq!(outcome, RunOutcome::Declined);

        // worker-a is the only registered launcher, so the request fails.
        let request = fixture
            .coordinator
            .get_request(handler.request().id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.state, RequestState::Failed);
        assert_eq!(request.declined_by, vec!["worker-a"]);
    }

    #[tokio::test]
    async fn test_decline_requeues_while_other_launchers_remain() {
        let mut fixture = fixture();
        fixture
            .coordinator
            .register_launcher("worker-b")
            .await
            .unwrap();
        let mut handler = claimed_handler(&fixture, vec!["gpu-monster"]).await;

        handler.run(&mut fixture.admission).await.unwrap();

        let request = fixture
            .coordinator
            .get_request(handler.request().id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.state, RequestState::Requested);
        assert_eq!(request.declined_by, vec!["worker-a"]);
        // Unlocked, so another worker can claim it.
        assert!(fixture
            .coordinator
            .try_lock_request(request.id, "worker-b")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_failed_node_tears_down_whole_attempt() {
        let mut fixture = fixture();
        // Enough injected failures that the first label's node exhausts
        // its attempts while the second label's node still goes ready.
        fixture.adapter.cloud().create_failures = 3;

        let mut handler = claimed_handler(&fixture, vec!["small", "large"]).await;
        handler.run(&mut fixture.admission).await.unwrap();
        let node_ids = handler.node_ids().to_vec();

        drive_worker(&mut fixture).await;
        assert_eq!(handler.poll().await.unwrap(), HandlerPoll::Complete);

        let request = fixture
            .coordinator
            .get_request(handler.request().id)
            .await
            .unwrap()
            .unwrap();
        // Only launcher registered, so the decline fails the request.
        assert_eq!(request.state, RequestState::Failed);
        assert!(request.declined_by.contains(&"worker-a".to_string()));

        // Both nodes, including any that went ready, are torn down.
        drive_worker(&mut fixture).await;
        for id in node_ids {
            assert!(fixture.coordinator.get_node(id).await.unwrap().is_none());
        }
        assert_eq!(fixture.adapter.cloud().instance_count(), 0);
    }
}
