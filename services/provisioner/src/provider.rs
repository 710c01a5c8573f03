//! Per-provider polling loop.
//!
//! One loop owns the full set of active launchers and deleters for a
//! provider and advances every member once per tick: cooperative
//! multiplexing, no thread per resource. The sleep between ticks adapts to
//! load: a short fixed interval when idle, and the provider's configured
//! rate minus time already spent when busy, so busy periods poll faster
//! within the provider's API budget.
//!
//! Work arrives over an mpsc handle so pool workers never touch the
//! launcher set directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use fleet_coordination::{Coordinator, Node};

use crate::adapter::Adapter;
use crate::config::{PoolLabelConfig, ProviderConfig};
use crate::deleter::NodeDeleter;
use crate::launcher::NodeLauncher;
use crate::scan::ScanPool;
use crate::stats::ProviderStats;

const IDLE_INTERVAL: Duration = Duration::from_millis(50);
const MIN_BUSY_INTERVAL: Duration = Duration::from_millis(10);

/// Work submitted to a provider loop.
pub enum ProviderCommand {
    Launch {
        node: Node,
        label: PoolLabelConfig,
    },
    Delete {
        node: Node,
    },
}

/// Cloneable submission handle for a provider loop.
#[derive(Clone)]
pub struct ProviderHandle {
    provider: String,
    tx: mpsc::UnboundedSender<ProviderCommand>,
}

impl ProviderHandle {
    /// Queue a node launch. Returns false if the loop has shut down.
    pub fn launch(&self, node: Node, label: PoolLabelConfig) -> bool {
        let accepted = self
            .tx
            .send(ProviderCommand::Launch { node, label })
            .is_ok();
        if !accepted {
            warn!(provider = %self.provider, "Launch dropped: provider loop gone");
        }
        accepted
    }

    /// Queue a node delete. Returns false if the loop has shut down.
    pub fn delete(&self, node: Node) -> bool {
        let accepted = self.tx.send(ProviderCommand::Delete { node }).is_ok();
        if !accepted {
            warn!(provider = %self.provider, "Delete dropped: provider loop gone");
        }
        accepted
    }
}

/// Drives all of one provider's in-flight operations.
pub struct ProviderWorker {
    provider: Arc<ProviderConfig>,
    adapter: Arc<dyn Adapter>,
    coordinator: Arc<dyn Coordinator>,
    scan_pool: ScanPool,
    launcher_id: String,

    rx: mpsc::UnboundedReceiver<ProviderCommand>,
    launchers: Vec<NodeLauncher>,
    deleters: Vec<NodeDeleter>,
    stats: ProviderStats,
}

impl ProviderWorker {
    pub fn new(
        provider: Arc<ProviderConfig>,
        adapter: Arc<dyn Adapter>,
        coordinator: Arc<dyn Coordinator>,
        scan_pool: ScanPool,
        launcher_id: String,
    ) -> (Self, ProviderHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ProviderHandle {
            provider: provider.name.clone(),
            tx,
        };
        let worker = Self {
            provider,
            adapter,
            coordinator,
            scan_pool,
            launcher_id,
            rx,
            launchers: Vec::new(),
            deleters: Vec::new(),
            stats: ProviderStats::default(),
        };
        (worker, handle)
    }

    pub fn stats(&self) -> ProviderStats {
        self.stats
    }

    /// Run the polling loop until shutdown is signaled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            provider = %self.provider.name,
            rate_ms = self.provider.rate_ms,
            "Starting provider loop"
        );

        loop {
            let tick_start = Instant::now();
            self.drain_commands();
            self.advance_all().await;

            let delay = self.next_delay(tick_start.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                command = self.rx.recv() => {
                    match command {
                        Some(command) => self.accept(command),
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(
                            provider = %self.provider.name,
                            in_flight = self.launchers.len() + self.deleters.len(),
                            "Provider loop shutting down"
                        );
                        break;
                    }
                }
            }
        }
    }

    pub(crate) fn drain_commands(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            self.accept(command);
        }
    }

    fn accept(&mut self, command: ProviderCommand) {
        match command {
            ProviderCommand::Launch { node, label } => {
                debug!(provider = %self.provider.name, node_id = node.id, "Accepting launch");
                self.launchers.push(NodeLauncher::new(
                    node,
                    label,
                    Arc::clone(&self.provider),
                    Arc::clone(&self.adapter),
                    Arc::clone(&self.coordinator),
                    self.scan_pool.clone(),
                    self.launcher_id.clone(),
                ));
            }
            ProviderCommand::Delete { node } => {
                debug!(provider = %self.provider.name, node_id = node.id, "Accepting delete");
                self.deleters.push(NodeDeleter::new(
                    node,
                    Arc::clone(&self.adapter),
                    Arc::clone(&self.coordinator),
                    self.launcher_id.clone(),
                ));
            }
        }
    }

    /// Advance every in-flight operation once and reap finished members.
    pub(crate) async fn advance_all(&mut self) {
        let mut remaining = Vec::with_capacity(self.launchers.len());
        for mut launcher in self.launchers.drain(..) {
            if launcher.tick().await {
                if let Some(state) = launcher.result() {
                    self.stats.launches.record(state);
                }
            } else {
                remaining.push(launcher);
            }
        }
        self.launchers = remaining;

        let mut remaining = Vec::with_capacity(self.deleters.len());
        for mut deleter in self.deleters.drain(..) {
            if deleter.tick().await {
                if deleter.deleted() {
                    self.stats.deletes += 1;
                } else {
                    self.stats.delete_failures += 1;
                }
            } else {
                remaining.push(deleter);
            }
        }
        self.deleters = remaining;
    }

    /// Sleep budget for the next tick.
    fn next_delay(&self, elapsed: Duration) -> Duration {
        if self.launchers.is_empty() && self.deleters.is_empty() {
            return IDLE_INTERVAL;
        }
        self.provider
            .rate()
            .saturating_sub(elapsed)
            .max(MIN_BUSY_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use fleet_coordination::{InMemoryCoordinator, NodeState};

    use crate::mock::MockAdapter;
    use crate::scan::StaticScanner;

    fn provider_config() -> Arc<ProviderConfig> {
        Arc::new(ProviderConfig {
            name: "cloud-a".to_string(),
            driver: "mock".to_string(),
            rate_ms: 200,
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

    fn new_worker(
        adapter: &Arc<MockAdapter>,
        coordinator: &Arc<InMemoryCoordinator>,
    ) -> (ProviderWorker, ProviderHandle) {
        ProviderWorker::new(
            provider_config(),
            Arc::clone(adapter) as Arc<dyn Adapter>,
            Arc::clone(coordinator) as Arc<dyn Coordinator>,
            ScanPool::new(
                Arc::new(StaticScanner::with_keys(vec!["key".to_string()])),
                2,
            ),
            "worker-a".to_string(),
        )
    }

    #[tokio::test]
    async fn test_launch_command_drives_node_to_ready() {
        let adapter = Arc::new(MockAdapter::new("cloud-a"));
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let (mut worker, handle) = new_worker(&adapter, &coordinator);

        let node = coordinator
            .create_node(Node::new("cloud-a", "main", "small"))
            .await
            .unwrap();
        assert!(handle.launch(node.clone(), test_label()));

        for _ in 0..50 {
            worker.drain_commands();
            worker.advance_all().await;
            if worker.stats().launches.total() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(worker.stats().launches.ready, 1);
        let stored = coordinator.get_node(node.id).await.unwrap().unwrap();
        assert_eq!(stored.state, NodeState::Ready);
    }

    #[tokio::test]
    async fn test_many_operations_multiplexed_on_one_loop() {
        let adapter = Arc::new(MockAdapter::new("cloud-a"));
        adapter.cloud().create_ticks = 3;
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let (mut worker, handle) = new_worker(&adapter, &coordinator);

        for _ in 0..5 {
            let node = coordinator
                .create_node(Node::new("cloud-a", "main", "small"))
                .await
                .unwrap();
            handle.launch(node, test_label());
        }

        for _ in 0..100 {
            worker.drain_commands();
            worker.advance_all().await;
            if worker.stats().launches.total() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(worker.stats().launches.ready, 5);
        assert_eq!(adapter.cloud().instance_count(), 5);
    }

    #[tokio::test]
    async fn test_adaptive_delay() {
        let adapter = Arc::new(MockAdapter::new("cloud-a"));
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let (mut worker, handle) = new_worker(&adapter, &coordinator);

        // Idle: short fixed interval.
        assert_eq!(worker.next_delay(Duration::from_millis(0)), IDLE_INTERVAL);

        let node = coordinator
            .create_node(Node::new("cloud-a", "main", "small"))
            .await
            .unwrap();
        handle.launch(node, test_label());
        worker.drain_commands();

        // Busy: rate minus elapsed, floored.
        assert_eq!(
            worker.next_delay(Duration::from_millis(50)),
            Duration::from_millis(150)
        );
        assert_eq!(
            worker.next_delay(Duration::from_millis(500)),
            MIN_BUSY_INTERVAL
        );
    }

    #[tokio::test]
    async fn test_run_honors_shutdown() {
        let adapter = Arc::new(MockAdapter::new("cloud-a"));
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let (worker, _handle) = new_worker(&adapter, &coordinator);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(worker.run(shutdown_rx));
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("loop exits on shutdown")
            .unwrap();
    }
}
