//! Node delete driver.
//!
//! A [`NodeDeleter`] tears down one node: it claims the record, drives the
//! adapter's delete state machine, and removes the record once the backing
//! resource is gone. Deletes are idempotent: an adapter "not found" is
//! success. Any other failure leaves the record in Deleting for a later
//! reconciliation pass instead of silently dropping it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use fleet_coordination::{CoordError, Coordinator, LockHandle, Node, NodeState};

use crate::adapter::{Adapter, AdapterError, StateMachine};

const DELETE_TIMEOUT: Duration = Duration::from_secs(600);

/// Drives one node's delete operation to completion.
pub struct NodeDeleter {
    node: Node,
    adapter: Arc<dyn Adapter>,
    coordinator: Arc<dyn Coordinator>,
    launcher_id: String,

    machine: Option<Box<dyn StateMachine>>,
    lock: Option<LockHandle>,
    started: Instant,
    started_machine: bool,
    done: bool,
    deleted: bool,
}

impl NodeDeleter {
    pub fn new(
        node: Node,
        adapter: Arc<dyn Adapter>,
        coordinator: Arc<dyn Coordinator>,
        launcher_id: String,
    ) -> Self {
        Self {
            node,
            adapter,
            coordinator,
            launcher_id,
            machine: None,
            lock: None,
            started: Instant::now(),
            started_machine: false,
            done: false,
            deleted: false,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// True once the node record was removed.
    pub fn deleted(&self) -> bool {
        self.deleted
    }

    /// Advance the delete by one unit of work. Returns true once finished.
    pub async fn tick(&mut self) -> bool {
        if self.done {
            return true;
        }

        if self.started.elapsed() >= DELETE_TIMEOUT {
            warn!(
                node_id = self.node.id,
                "Delete timed out; leaving record for reconciliation"
            );
            self.abandon().await;
            return true;
        }

        if !self.started_machine {
            self.start().await;
            return self.done;
        }

        self.advance().await;
        self.done
    }

    async fn start(&mut self) {
        self.started_machine = true;

        match self.coordinator.try_lock_node(self.node.id, &self.launcher_id).await {
            Ok(Some(lock)) => self.lock = Some(lock),
            Ok(None) => {
                // Another process owns the node; it is their delete now.
                debug!(node_id = self.node.id, "Node locked elsewhere, skipping delete");
                self.done = true;
                return;
            }
            Err(CoordError::NotFound(_)) => {
                // Record already gone; nothing left to do.
                self.done = true;
                self.deleted = true;
                return;
            }
            Err(e) => {
                warn!(node_id = self.node.id, error = %e, "Failed to lock node for delete");
                self.done = true;
                return;
            }
        }

        self.node.set_state(NodeState::Deleting);
        if let Some(lock) = self.lock.as_ref() {
            if let Err(e) = self.coordinator.update_node(&self.node, lock).await {
                warn!(node_id = self.node.id, error = %e, "Failed to mark node deleting");
                self.abandon().await;
                return;
            }
        }

        let Some(external_id) = self.node.external_id.clone() else {
            // Nothing was ever created; just drop the record.
            self.remove_record().await;
            return;
        };

        match self.adapter.delete_state_machine(&external_id).await {
            Ok(machine) => self.machine = Some(machine),
            Err(AdapterError::NotFound(_)) => self.remove_record().await,
            Err(e) => {
                warn!(
                    node_id = self.node.id,
                    external_id = %external_id,
                    error = %e,
                    "Failed to start delete, leaving record for reconciliation"
                );
                self.abandon().await;
            }
        }
    }

    async fn advance(&mut self) {
        let result = {
            let machine = self.machine.as_mut().expect("machine started");
            let result = machine.advance().await;
            result.map(|_| machine.complete())
        };
        match result {
            Ok(true) => self.remove_record().await,
            Ok(false) => {}
            // An already-gone resource is a successful delete.
            Err(AdapterError::NotFound(_)) => self.remove_record().await,
            Err(e) => {
                warn!(
                    node_id = self.node.id,
                    error = %e,
                    "Delete failed, leaving record for reconciliation"
                );
                self.abandon().await;
            }
        }
    }

    /// Remove the record and release its lock.
    async fn remove_record(&mut self) {
        match self.lock.take() {
            Some(lock) => {
                if let Err(e) = self.coordinator.delete_node(self.node.id, lock).await {
                    warn!(node_id = self.node.id, error = %e, "Failed to remove node record");
                } else {
                    info!(
                        node_id = self.node.id,
                        external_id = self.node.external_id.as_deref().unwrap_or(""),
                        "Node deleted"
                    );
                    self.deleted = true;
                }
            }
            None => warn!(node_id = self.node.id, "Delete finished without a lock"),
        }
        self.done = true;
    }

    /// Leave the record in Deleting and release our lock, if any.
    async fn abandon(&mut self) {
        if let Some(lock) = self.lock.take() {
            let _ = self.coordinator.unlock(lock).await;
        }
        self.done = true;
    }
}
