//! Engine wiring.
//!
//! Builds adapters from the driver registry and spawns the task set for a
//! configuration: one provider loop per provider, one pool worker per
//! (provider, pool), and a single cleanup worker. The embedding process
//! owns logging and signal handling; this module owns the shutdown
//! channel.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use fleet_coordination::Coordinator;

use crate::cleanup::{CleanupTarget, CleanupWorker, CleanupWorkerConfig};
use crate::config::Config;
use crate::pool::PoolWorker;
use crate::provider::ProviderWorker;
use crate::registry::DriverRegistry;
use crate::scan::{KeyScanner, ScanPool};

const SCAN_WORKERS: usize = 4;

/// A running provisioning engine.
pub struct ProvisionerService {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProvisionerService {
    /// Build adapters and spawn every worker for `config`.
    pub fn start(
        config: Config,
        registry: &DriverRegistry,
        coordinator: Arc<dyn Coordinator>,
        scanner: Arc<dyn KeyScanner>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let mut cleanup_targets = Vec::new();

        for provider_config in config.providers {
            let provider = Arc::new(provider_config);
            let adapter = registry
                .build(&provider)
                .with_context(|| format!("building adapter for provider {}", provider.name))?;
            let scan_pool = ScanPool::new(Arc::clone(&scanner), SCAN_WORKERS);
            let launcher_id = format!("{}-{}", provider.name, std::process::id());

            let (provider_worker, handle) = ProviderWorker::new(
                Arc::clone(&provider),
                Arc::clone(&adapter),
                Arc::clone(&coordinator),
                scan_pool,
                launcher_id,
            );
            tasks.push(tokio::spawn(provider_worker.run(shutdown_rx.clone())));

            for pool_config in &provider.pools {
                let pool = Arc::new(pool_config.clone());
                let worker_id =
                    format!("{}-{}-{}", provider.name, pool.name, std::process::id());
                let pool_worker = PoolWorker::new(
                    worker_id,
                    Arc::clone(&provider),
                    pool,
                    Arc::clone(&adapter),
                    Arc::clone(&coordinator),
                    handle.clone(),
                );
                tasks.push(tokio::spawn(pool_worker.run(shutdown_rx.clone())));
            }

            cleanup_targets.push(CleanupTarget {
                provider,
                adapter,
                handle,
            });
        }

        let cleanup = CleanupWorker::new(
            Arc::clone(&coordinator),
            cleanup_targets,
            CleanupWorkerConfig::default(),
        );
        tasks.push(tokio::spawn(cleanup.run(shutdown_rx)));

        info!(tasks = tasks.len(), "Provisioner started");
        Ok(Self { shutdown_tx, tasks })
    }

    /// Signal shutdown and wait for every worker to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Provisioner shutdown complete");
    }
}
