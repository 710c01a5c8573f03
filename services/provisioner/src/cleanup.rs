//! Periodic reconciliation worker.
//!
//! Runs on its own cadence, independent of the provider and pool loops:
//!
//! - **Leak reconciliation**: lists every resource visible to each
//!   provider and flags those tagged as ours whose node record is gone. A
//!   resource is deleted only on its second consecutive flagged pass, so a
//!   resource mid-creation that has not registered yet is never raced.
//! - **Node sweep**: requeues unlocked nodes stuck in Deleting (or
//!   terminally failed with nothing driving them), which reclaims work
//!   abandoned by a previous process on startup.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fleet_coordination::{ConnectionState, Coordinator, NodeState};

use crate::adapter::Adapter;
use crate::config::ProviderConfig;
use crate::provider::ProviderHandle;

/// One provider under cleanup supervision.
pub struct CleanupTarget {
    pub provider: Arc<ProviderConfig>,
    pub adapter: Arc<dyn Adapter>,
    pub handle: ProviderHandle,
}

#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    pub interval: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Periodic leak reconciliation and stale-node sweeps.
pub struct CleanupWorker {
    coordinator: Arc<dyn Coordinator>,
    targets: Vec<CleanupTarget>,
    config: CleanupWorkerConfig,

    /// Resources flagged as possibly leaked on the previous pass, by
    /// provider name.
    leak_candidates: HashMap<String, HashSet<String>>,
}

impl CleanupWorker {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        targets: Vec<CleanupTarget>,
        config: CleanupWorkerConfig,
    ) -> Self {
        Self {
            coordinator,
            targets,
            config,
            leak_candidates: HashMap::new(),
        }
    }

    /// Run the worker until shutdown is signaled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            providers = self.targets.len(),
            "Starting cleanup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        // Skip the immediate first tick so launchers get a head start.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cleanup().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One cleanup pass over every provider.
    pub(crate) async fn run_cleanup(&mut self) {
        if self.coordinator.connection_state() != ConnectionState::Connected {
            debug!("Coordination connection degraded, skipping cleanup pass");
            return;
        }

        for idx in 0..self.targets.len() {
            let provider = self.targets[idx].provider.name.clone();
            if let Err(e) = self.reconcile_leaks(idx).await {
                error!(provider = %provider, error = %e, "Leak reconciliation failed");
            }
            if let Err(e) = self.sweep_nodes(idx).await {
                error!(provider = %provider, error = %e, "Node sweep failed");
            }
        }
    }

    /// Two-pass leak detection for one provider.
    async fn reconcile_leaks(&mut self, idx: usize) -> Result<()> {
        let provider_name = self.targets[idx].provider.name.clone();
        let adapter = Arc::clone(&self.targets[idx].adapter);

        let resources = adapter.list_resources().await?;
        let nodes = self.coordinator.list_nodes().await?;
        let known_node_ids: HashSet<String> = nodes
            .iter()
            .filter(|n| n.provider == provider_name)
            .map(|n| n.id.to_string())
            .collect();

        let previous = self
            .leak_candidates
            .remove(&provider_name)
            .unwrap_or_default();
        let mut flagged = HashSet::new();
        let mut deleted = 0u64;

        for resource in resources {
            if resource.owner() != Some(provider_name.as_str()) {
                continue;
            }
            let tracked = resource
                .node_id()
                .map(|id| known_node_ids.contains(id))
                .unwrap_or(false);
            if tracked {
                continue;
            }

            if previous.contains(&resource.id) {
                info!(
                    provider = %provider_name,
                    resource_id = %resource.id,
                    kind = %resource.kind,
                    "Deleting leaked resource"
                );
                if let Err(e) = adapter.delete_resource(&resource).await {
                    warn!(
                        provider = %provider_name,
                        resource_id = %resource.id,
                        error = %e,
                        "Failed to delete leaked resource"
                    );
                } else {
                    deleted += 1;
                }
            } else {
                debug!(
                    provider = %provider_name,
                    resource_id = %resource.id,
                    "Flagging unmatched resource; deleting if still present next pass"
                );
                flagged.insert(resource.id);
            }
        }

        if deleted > 0 {
            info!(provider = %provider_name, deleted, "Leak reconciliation pass complete");
        }
        self.leak_candidates.insert(provider_name, flagged);
        Ok(())
    }

    /// Requeue unlocked nodes nothing is driving anymore.
    async fn sweep_nodes(&mut self, idx: usize) -> Result<()> {
        let target = &self.targets[idx];
        let nodes = self.coordinator.list_nodes().await?;
        for node in nodes {
            if node.provider != target.provider.name {
                continue;
            }
            let stale = matches!(
                node.state,
                NodeState::Deleting | NodeState::Failed | NodeState::Aborted
            );
            if !stale {
                continue;
            }
            if self.coordinator.is_node_locked(node.id).await? {
                continue;
            }
            debug!(
                provider = %target.provider.name,
                node_id = node.id,
                state = ?node.state,
                "Requeueing abandoned node for deletion"
            );
            target.handle.delete(node);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap as StdHashMap;

    use fleet_coordination::{InMemoryCoordinator, Node};

    use crate::adapter::{ProviderResource, NODE_METADATA_KEY, OWNER_METADATA_KEY};
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

    fn orphan_resource(id: &str, node_id: Option<&str>) -> ProviderResource {
        let mut metadata = StdHashMap::new();
        metadata.insert(OWNER_METADATA_KEY.to_string(), "cloud-a".to_string());
        if let Some(node_id) = node_id {
            metadata.insert(NODE_METADATA_KEY.to_string(), node_id.to_string());
        }
        ProviderResource {
            id: id.to_string(),
            kind: "instance".to_string(),
            metadata,
        }
    }

    struct Fixture {
        adapter: Arc<MockAdapter>,
        coordinator: Arc<InMemoryCoordinator>,
        provider_worker: ProviderWorker,
        cleanup: CleanupWorker,
    }

    fn fixture() -> Fixture {
        let adapter = Arc::new(MockAdapter::new("cloud-a"));
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let provider = provider_config();
        let (provider_worker, handle) = ProviderWorker::new(
            Arc::clone(&provider),
            Arc::clone(&adapter) as Arc<dyn Adapter>,
            Arc::clone(&coordinator) as Arc<dyn Coordinator>,
            ScanPool::new(
                Arc::new(StaticScanner::with_keys(vec!["key".to_string()])),
                2,
            ),
            "cloud-a-cleanup".to_string(),
        );
        let cleanup = CleanupWorker::new(
            Arc::clone(&coordinator) as Arc<dyn Coordinator>,
            vec![CleanupTarget {
                provider,
                adapter: Arc::clone(&adapter) as Arc<dyn Adapter>,
                handle,
            }],
            CleanupWorkerConfig::default(),
        );
        Fixture {
            adapter,
            coordinator,
            provider_worker,
            cleanup,
        }
    }

    fn resource_present(adapter: &MockAdapter, id: &str) -> bool {
        adapter
            .cloud()
            .extra_resources
            .iter()
            .any(|r| r.id == id)
    }

    #[tokio::test]
    async fn test_leak_deleted_only_on_second_consecutive_pass() {
        let mut fixture = fixture();
        fixture
            .adapter
            .cloud()
            .extra_resources
            .push(orphan_resource("i-leaked", Some("999")));

        fixture.cleanup.run_cleanup().await;
        assert!(resource_present(&fixture.adapter, "i-leaked"));

        fixture.cleanup.run_cleanup().await;
        assert!(!resource_present(&fixture.adapter, "i-leaked"));
    }

    #[tokio::test]
    async fn test_tracked_resource_never_deleted() {
        let mut fixture = fixture();
        let node = fixture
            .coordinator
            .create_node(Node::new("cloud-a", "main", "small"))
            .await
            .unwrap();
        fixture
            .adapter
            .cloud()
            .extra_resources
            .push(orphan_resource("i-tracked", Some(&node.id.to_string())));

        for _ in 0..3 {
            fixture.cleanup.run_cleanup().await;
        }
        assert!(resource_present(&fixture.adapter, "i-tracked"));
    }

    #[tokio::test]
    async fn test_foreign_resource_ignored() {
        let mut fixture = fixture();
        let mut resource = orphan_resource("i-foreign", None);
        resource
            .metadata
            .insert(OWNER_METADATA_KEY.to_string(), "cloud-b".to_string());
        fixture.adapter.cloud().extra_resources.push(resource);

        for _ in 0..3 {
            fixture.cleanup.run_cleanup().await;
        }
        assert!(resource_present(&fixture.adapter, "i-foreign"));
    }

    #[tokio::test]
    async fn test_sightings_must_be_consecutive() {
        let mut fixture = fixture();
        fixture
            .adapter
            .cloud()
            .extra_resources
            .push(orphan_resource("i-flaky", Some("999")));

        fixture.cleanup.run_cleanup().await;
        // The resource disappears for a pass (e.g. mid-registration).
        let taken: Vec<_> = fixture.adapter.cloud().extra_resources.drain(..).collect();
        fixture.cleanup.run_cleanup().await;
        fixture.adapter.cloud().extra_resources.extend(taken);

        // Back again, but its flag was cleared; one more sighting needed.
        fixture.cleanup.run_cleanup().await;
        assert!(resource_present(&fixture.adapter, "i-flaky"));
        fixture.cleanup.run_cleanup().await;
        assert!(!resource_present(&fixture.adapter, "i-flaky"));
    }

    #[tokio::test]
    async fn test_abandoned_deleting_node_is_requeued() {
        let mut fixture = fixture();
        let mut node = Node::new("cloud-a", "main", "small");
        node.state = NodeState::Deleting;
        let node = fixture.coordinator.create_node(node).await.unwrap();

        fixture.cleanup.run_cleanup().await;
        for _ in 0..10 {
            fixture.provider_worker.drain_commands();
            fixture.provider_worker.advance_all().await;
        }

        assert!(fixture.coordinator.get_node(node.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_locked_node_not_requeued() {
        let mut fixture = fixture();
        let mut node = Node::new("cloud-a", "main", "small");
        node.state = NodeState::Deleting;
        let node = fixture.coordinator.create_node(node).await.unwrap();
        let _held = fixture
            .coordinator
            .try_lock_node(node.id, "other-worker")
            .await
            .unwrap()
            .unwrap();

        fixture.cleanup.run_cleanup().await;
        for _ in 0..10 {
            fixture.provider_worker.drain_commands();
            fixture.provider_worker.advance_all().await;
        }

        assert!(fixture.coordinator.get_node(node.id).await.unwrap().is_some());
    }
}
