//! Mock provider adapter.
//!
//! The built-in driver for tests and local development. Backed by a shared
//! in-process cloud whose knobs allow injecting create failures, quota
//! rejections, slow boots, and out-of-band resources, so every launcher,
//! admission, and leak-reconciliation path can be exercised without a real
//! provider.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use fleet_quota::{QuotaInformation, INSTANCES};

use crate::adapter::{
    Adapter, AdapterError, AdapterResult, CreateParams, Instance, ProviderResource, StateMachine,
    NODE_METADATA_KEY, OWNER_METADATA_KEY, STATE_START,
};
use crate::config::PoolLabelConfig;

/// Shared state of the fake cloud.
#[derive(Debug, Default)]
pub struct MockCloud {
    next_id: u64,
    instances: HashMap<String, Instance>,

    /// Resources visible to the account that no instance backs
    /// (out-of-band creations, leak-test seeds).
    pub extra_resources: Vec<ProviderResource>,

    /// Fail the next N create attempts with a transient error.
    pub create_failures: u32,

    /// Fail the next N create attempts with a quota rejection.
    pub quota_failures: u32,

    /// Ticks a create machine spends building before completing.
    pub create_ticks: u32,

    /// Account-wide limits; unlimited unless a test caps them.
    pub limits: QuotaInformation,

    /// Per-label resource consumption; labels absent here default to one
    /// instance.
    pub label_quotas: HashMap<String, QuotaInformation>,

    /// Report quota operations as unsupported, exercising callers'
    /// fallback paths.
    pub quota_unsupported: bool,

    /// Total create attempts observed, including failed ones.
    pub create_attempts: u32,
}

impl MockCloud {
    fn new() -> Self {
        Self {
            create_ticks: 1,
            limits: QuotaInformation::unlimited(),
            ..Self::default()
        }
    }

    fn next_external_id(&mut self) -> String {
        self.next_id += 1;
        format!("mock-{:08}", self.next_id)
    }

    /// Register an instance as if created outside this engine.
    pub fn seed_instance(&mut self, external_id: &str, quota: QuotaInformation) {
        self.instances.insert(
            external_id.to_string(),
            Instance {
                external_id: external_id.to_string(),
                addresses: vec!["192.0.2.1".to_string()],
                metadata: HashMap::new(),
                quota,
                username: None,
                connection_type: None,
                connection_port: None,
                shell_type: None,
                driver_data: None,
            },
        );
    }

    /// Drop an instance as if deleted outside this engine.
    pub fn remove_instance(&mut self, external_id: &str) {
        self.instances.remove(external_id);
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn has_instance(&self, external_id: &str) -> bool {
        self.instances.contains_key(external_id)
    }
}

/// Mock [`Adapter`] implementation.
pub struct MockAdapter {
    name: String,
    cloud: Arc<Mutex<MockCloud>>,
}

impl MockAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cloud: Arc::new(Mutex::new(MockCloud::new())),
        }
    }

    /// Direct access to the fake cloud for test setup and assertions.
    pub fn cloud(&self) -> MutexGuard<'_, MockCloud> {
        self.cloud.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cloud_handle(&self) -> Arc<Mutex<MockCloud>> {
        Arc::clone(&self.cloud)
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_state_machine(
        &self,
        params: CreateParams,
    ) -> AdapterResult<Box<dyn StateMachine>> {
        Ok(Box::new(MockCreateMachine {
            cloud: self.cloud_handle(),
            params,
            state: STATE_START.to_string(),
            external_id: None,
            ticks_remaining: 0,
            complete: false,
        }))
    }

    async fn delete_state_machine(
        &self,
        external_id: &str,
    ) -> AdapterResult<Box<dyn StateMachine>> {
        Ok(Box::new(MockDeleteMachine {
            cloud: self.cloud_handle(),
            external_id: external_id.to_string(),
            state: STATE_START.to_string(),
            complete: false,
        }))
    }

    async fn list_instances(&self) -> AdapterResult<Vec<Instance>> {
        Ok(self.cloud().instances.values().cloned().collect())
    }

    async fn list_resources(&self) -> AdapterResult<Vec<ProviderResource>> {
        let cloud = self.cloud();
        let mut resources: Vec<ProviderResource> = cloud
            .instances
            .values()
            .map(|i| ProviderResource {
                id: i.external_id.clone(),
                kind: "instance".to_string(),
                metadata: i.metadata.clone(),
            })
            .collect();
        resources.extend(cloud.extra_resources.iter().cloned());
        Ok(resources)
    }

    async fn delete_resource(&self, resource: &ProviderResource) -> AdapterResult<()> {
        let mut cloud = self.cloud();
        cloud.instances.remove(&resource.id);
        cloud.extra_resources.retain(|r| r.id != resource.id);
        Ok(())
    }

    async fn quota_limits(&self) -> AdapterResult<QuotaInformation> {
        let cloud = self.cloud();
        if cloud.quota_unsupported {
            return Err(AdapterError::NotImplemented("quota_limits"));
        }
        Ok(cloud.limits.clone())
    }

    async fn label_quota(&self, label: &PoolLabelConfig) -> AdapterResult<QuotaInformation> {
        let cloud = self.cloud();
        if cloud.quota_unsupported {
            return Err(AdapterError::NotImplemented("label_quota"));
        }
        Ok(cloud.label_quotas.get(&label.name).cloned().unwrap_or_else(
            || QuotaInformation::zero().with_resource(INSTANCES, 1.0),
        ))
    }
}

struct MockCreateMachine {
    cloud: Arc<Mutex<MockCloud>>,
    params: CreateParams,
    state: String,
    external_id: Option<String>,
    ticks_remaining: u32,
    complete: bool,
}

#[async_trait]
impl StateMachine for MockCreateMachine {
    fn state(&self) -> &str {
        &self.state
    }

    fn external_id(&self) -> Option<&str> {
        self.external_id.as_deref()
    }

    fn complete(&self) -> bool {
        self.complete
    }

    async fn advance(&mut self) -> AdapterResult<Option<Instance>> {
        let mut cloud = self.cloud.lock().unwrap_or_else(|e| e.into_inner());
        match self.state.as_str() {
            STATE_START => {
                cloud.create_attempts += 1;
                if cloud.quota_failures > 0 {
                    cloud.quota_failures -= 1;
                    return Err(AdapterError::Quota("instance quota exhausted".into()));
                }
                if cloud.create_failures > 0 {
                    cloud.create_failures -= 1;
                    return Err(AdapterError::Provider(anyhow::anyhow!(
                        "synthetic create failure"
                    )));
                }

                let external_id = cloud.next_external_id();
                let quota = cloud
                    .label_quotas
                    .get(&self.params.label.name)
                    .cloned()
                    .unwrap_or_else(|| QuotaInformation::zero().with_resource(INSTANCES, 1.0));
                let mut metadata = self.params.metadata.clone();
                metadata.insert("hostname".to_string(), self.params.hostname.clone());
                cloud.instances.insert(
                    external_id.clone(),
                    Instance {
                        external_id: external_id.clone(),
                        addresses: vec!["192.0.2.10".to_string()],
                        metadata,
                        quota,
                        username: Some("ci".to_string()),
                        connection_type: Some("ssh".to_string()),
                        connection_port: Some(22),
                        shell_type: None,
                        driver_data: None,
                    },
                );

                debug!(external_id = %external_id, hostname = %self.params.hostname, "[MOCK] create issued");
                self.external_id = Some(external_id);
                self.ticks_remaining = cloud.create_ticks;
                self.state = "building".to_string();
                Ok(None)
            }
            "building" => {
                if self.ticks_remaining > 1 {
                    self.ticks_remaining -= 1;
                    return Ok(None);
                }
                self.state = "complete".to_string();
                self.complete = true;
                let external_id = self.external_id.as_ref().expect("id set before building");
                let instance = cloud
                    .instances
                    .get(external_id)
                    .cloned()
                    .ok_or_else(|| AdapterError::NotFound(external_id.clone()))?;
                Ok(Some(instance))
            }
            other => Err(AdapterError::Provider(anyhow::anyhow!(
                "unexpected state {other}"
            ))),
        }
    }
}

struct MockDeleteMachine {
    cloud: Arc<Mutex<MockCloud>>,
    external_id: String,
    state: String,
    complete: bool,
}

#[async_trait]
impl StateMachine for MockDeleteMachine {
    fn state(&self) -> &str {
        &self.state
    }

    fn external_id(&self) -> Option<&str> {
        Some(&self.external_id)
    }

    fn complete(&self) -> bool {
        self.complete
    }

    async fn advance(&mut self) -> AdapterResult<Option<Instance>> {
        let mut cloud = self.cloud.lock().unwrap_or_else(|e| e.into_inner());
        if cloud.instances.remove(&self.external_id).is_none() {
            return Err(AdapterError::NotFound(self.external_id.clone()));
        }
        debug!(external_id = %self.external_id, "[MOCK] instance deleted");
        self.state = "complete".to_string();
        self.complete = true;
        Ok(None)
    }
}
