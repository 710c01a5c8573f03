//! Per-provider-pool request worker.
//!
//! One worker per (provider, pool) claims pending requests from the
//! coordination service and drives their handlers. Each cycle it:
//!
//! - skips all work while the coordination connection is degraded
//! - re-registers its own liveness
//! - retries the paused request if one exists, otherwise scans for new
//!   requests (paused workers do not claim new work, so a request that
//!   can never complete cannot starve the queue behind it)
//! - polls active handlers and reaps finished ones
//!
//! On shutdown, in-flight handlers are abandoned; their records are
//! reclaimed by the cleanup pass on next startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleet_coordination::{ConnectionState, CoordError, Coordinator, RequestState};

use crate::adapter::Adapter;
use crate::admission::AdmissionControl;
use crate::config::{PoolConfig, ProviderConfig};
use crate::handler::{HandlerPoll, RequestHandler, RunOutcome};
use crate::provider::ProviderHandle;

const SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// Claims and handles node requests for one provider pool.
pub struct PoolWorker {
    launcher_id: String,
    provider: Arc<ProviderConfig>,
    pool: Arc<PoolConfig>,
    coordinator: Arc<dyn Coordinator>,
    provider_handle: ProviderHandle,
    admission: AdmissionControl,
    active: Vec<RequestHandler>,
    paused: Option<RequestHandler>,
}

impl PoolWorker {
    pub fn new(
        launcher_id: String,
        provider: Arc<ProviderConfig>,
        pool: Arc<PoolConfig>,
        adapter: Arc<dyn Adapter>,
        coordinator: Arc<dyn Coordinator>,
        provider_handle: ProviderHandle,
    ) -> Self {
        let admission = AdmissionControl::new(
            Arc::clone(&provider),
            Arc::clone(&pool),
            adapter,
            Arc::clone(&coordinator),
        );
        Self {
            launcher_id,
            provider,
            pool,
            coordinator,
            provider_handle,
            admission,
            active: Vec::new(),
            paused: None,
        }
    }

    /// Run the worker until shutdown is signaled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            launcher_id = %self.launcher_id,
            provider = %self.provider.name,
            pool = %self.pool.name,
            "Starting pool worker"
        );

        let mut interval = tokio::time::interval(SCAN_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(
                            launcher_id = %self.launcher_id,
                            error = %e,
                            "Pool worker cycle failed"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(
                            launcher_id = %self.launcher_id,
                            abandoned = self.active.len(),
                            "Pool worker shutting down"
                        );
                        break;
                    }
                }
            }
        }
    }

    /// One worker cycle.
    pub(crate) async fn tick(&mut self) -> Result<()> {
        if self.coordinator.connection_state() != ConnectionState::Connected {
            debug!(
                launcher_id = %self.launcher_id,
                "Coordination connection degraded, deferring work"
            );
            return Ok(());
        }

        self.coordinator.register_launcher(&self.launcher_id).await?;

        if let Some(mut handler) = self.paused.take() {
            match handler.retry(&mut self.admission).await {
                Ok(RunOutcome::Accepted) => {
                    info!(
                        launcher_id = %self.launcher_id,
                        request_id = handler.request().id,
                        "Paused request admitted, resuming"
                    );
                    self.active.push(handler);
                }
                Ok(RunOutcome::Paused) => self.paused = Some(handler),
                Ok(RunOutcome::Declined) => {}
                Err(e) => {
                    // Keep the handler so the request is not stranded in
                    // a claimed-but-forgotten state.
                    self.paused = Some(handler);
                    return Err(e);
                }
            }
        } else {
            self.scan_requests().await?;
        }

        self.poll_active().await;
        Ok(())
    }

    /// Claim pending requests this worker can take on.
    async fn scan_requests(&mut self) -> Result<()> {
        let requests = self.coordinator.list_requests().await?;
        for request in requests {
            if request.state != RequestState::Requested {
                continue;
            }
            if request.declined_by.contains(&self.launcher_id) {
                continue;
            }
            if let Some(max) = self.provider.max_concurrency {
                if self.active.len() >= max {
                    debug!(
                        launcher_id = %self.launcher_id,
                        max_concurrency = max,
                        "At concurrency limit, deferring remaining requests"
                    );
                    break;
                }
            }
            if self.paused.is_some() {
                break;
            }

            let lock = match self
                .coordinator
                .try_lock_request(request.id, &self.launcher_id)
                .await
            {
                Ok(Some(lock)) => lock,
                Ok(None) => continue,
                Err(CoordError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            // Re-validate under the lock: another process may have raced
            // us between the listing and the acquisition.
            let Some(fresh) = self.coordinator.get_request(request.id).await? else {
                let _ = self.coordinator.unlock(lock).await;
                continue;
            };
            if fresh.state != RequestState::Requested
                || fresh.declined_by.contains(&self.launcher_id)
            {
                let _ = self.coordinator.unlock(lock).await;
                continue;
            }

            debug!(
                launcher_id = %self.launcher_id,
                request_id = fresh.id,
                labels = ?fresh.labels,
                "Claimed request"
            );
            let mut handler = RequestHandler::new(
                fresh,
                lock,
                self.launcher_id.clone(),
                Arc::clone(&self.provider),
                Arc::clone(&self.pool),
                Arc::clone(&self.coordinator),
                self.provider_handle.clone(),
            );
            match handler.run(&mut self.admission).await {
                Ok(RunOutcome::Accepted) => self.active.push(handler),
                Ok(RunOutcome::Paused) => {
                    info!(
                        launcher_id = %self.launcher_id,
                        request_id = handler.request().id,
                        "Pausing until the claimed request can be admitted"
                    );
                    self.paused = Some(handler);
                }
                Ok(RunOutcome::Declined) => {}
                Err(e) => {
                    warn!(
                        launcher_id = %self.launcher_id,
                        request_id = handler.request().id,
                        error = %e,
                        "Handler failed during admission"
                    );
                }
            }
        }
        Ok(())
    }

    /// Poll in-flight handlers, reaping finished ones.
    async fn poll_active(&mut self) {
        let mut remaining = Vec::with_capacity(self.active.len());
        for mut handler in self.active.drain(..) {
            match handler.poll().await {
                Ok(HandlerPoll::Pending) => remaining.push(handler),
                Ok(HandlerPoll::Complete) => {
                    debug!(
                        launcher_id = %self.launcher_id,
                        request_id = handler.request().id,
                        "Handler complete"
                    );
                }
                Err(e) => {
                    warn!(
                        launcher_id = %self.launcher_id,
                        request_id = handler.request().id,
                        error = %e,
                        "Handler poll failed; leaving request for reconciliation"
                    );
                }
            }
        }
        self.active = remaining;
    }

    pub(crate) fn active_handlers(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.is_some()
    }
}
