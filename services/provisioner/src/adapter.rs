//! Provider adapter contract.
//!
//! An [`Adapter`] is the per-cloud implementation of create, delete, list,
//! and quota operations. The engine never calls an adapter method from more
//! than one place at a time per state machine, and every call is expected
//! to perform at most one bounded provider interaction.
//!
//! Create and delete operations are expressed as resumable
//! [`StateMachine`]s so one provider loop can drive many in-flight
//! operations cooperatively without a thread per resource.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use fleet_quota::QuotaInformation;

use crate::config::PoolLabelConfig;

/// Initial state tag of every state machine.
pub const STATE_START: &str = "start";

/// Metadata key tagging a resource with the provider that owns it.
pub const OWNER_METADATA_KEY: &str = "fleet_provider";

/// Metadata key tagging a resource with the node record it backs.
pub const NODE_METADATA_KEY: &str = "fleet_node_id";

/// Adapter failure taxonomy.
///
/// Provider-specific errors are converted to these variants at the
/// launcher/deleter boundary; nothing above the pool worker sees
/// provider-specific error types.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The provider rejected the operation for quota. Never retried.
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// The referenced resource does not exist. Success for deletes.
    #[error("not found: {0}")]
    NotFound(String),

    /// The adapter does not support this operation; callers fall back to
    /// defaults (unconstrained limits, one instance per label).
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Transient provider failure; launches retry up to the configured
    /// attempt count.
    #[error("provider error: {0}")]
    Provider(anyhow::Error),
}

impl From<anyhow::Error> for AdapterError {
    fn from(error: anyhow::Error) -> Self {
        Self::Provider(error)
    }
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider(_))
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Normalized view of a provisioned unit, read-only to the engine.
#[derive(Debug, Clone)]
pub struct Instance {
    pub external_id: String,
    pub addresses: Vec<String>,
    pub metadata: HashMap<String, String>,

    /// Actual resources this instance consumes.
    pub quota: QuotaInformation,

    /// Per-instance connection overrides, when the image dictates them.
    pub username: Option<String>,
    pub connection_type: Option<String>,
    pub connection_port: Option<u16>,
    pub shell_type: Option<String>,

    /// Driver-opaque payload stored on the node record.
    pub driver_data: Option<serde_json::Value>,
}

/// Any provider-visible resource, used for leak detection.
#[derive(Debug, Clone)]
pub struct ProviderResource {
    pub id: String,
    pub kind: String,
    pub metadata: HashMap<String, String>,
}

impl ProviderResource {
    /// The provider tagged as owner, if this engine created the resource.
    pub fn owner(&self) -> Option<&str> {
        self.metadata.get(OWNER_METADATA_KEY).map(String::as_str)
    }

    /// The node record this resource claims to back.
    pub fn node_id(&self) -> Option<&str> {
        self.metadata.get(NODE_METADATA_KEY).map(String::as_str)
    }
}

/// Inputs to a create state machine.
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub hostname: String,
    pub label: PoolLabelConfig,
    pub image_id: String,
    pub metadata: HashMap<String, String>,
    pub retries: u32,
}

/// A resumable, non-blocking representation of one in-progress provider
/// operation.
///
/// `advance` performs at most one bounded provider interaction per call and
/// must be safe to call repeatedly until `complete` returns true. State
/// tags are adapter-defined; the only universal tag is [`STATE_START`].
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Current adapter-defined state tag.
    fn state(&self) -> &str;

    /// Provider handle, as soon as it is known.
    fn external_id(&self) -> Option<&str>;

    /// True once the operation has finished.
    fn complete(&self) -> bool;

    /// Perform one unit of work. Create machines return the normalized
    /// instance when they complete; delete machines return `None`.
    async fn advance(&mut self) -> AdapterResult<Option<Instance>>;
}

/// The per-cloud implementation of create/delete/list/quota operations.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    async fn create_state_machine(
        &self,
        params: CreateParams,
    ) -> AdapterResult<Box<dyn StateMachine>>;

    async fn delete_state_machine(&self, external_id: &str)
        -> AdapterResult<Box<dyn StateMachine>>;

    /// Every instance visible to this provider account, not just ones this
    /// engine created. Required for accurate quota accounting.
    async fn list_instances(&self) -> AdapterResult<Vec<Instance>>;

    /// Every resource visible to this provider account, for leak
    /// detection.
    async fn list_resources(&self) -> AdapterResult<Vec<ProviderResource>>;

    async fn delete_resource(&self, resource: &ProviderResource) -> AdapterResult<()>;

    /// Account-wide resource limits.
    async fn quota_limits(&self) -> AdapterResult<QuotaInformation>;

    /// Resources one node of this label consumes.
    async fn label_quota(&self, label: &PoolLabelConfig) -> AdapterResult<QuotaInformation>;

    /// Optional image-management capability.
    async fn upload_image(&self, _name: &str, _source: &str) -> AdapterResult<String> {
        Err(AdapterError::NotImplemented("upload_image"))
    }

    async fn delete_image(&self, _image_id: &str) -> AdapterResult<()> {
        Err(AdapterError::NotImplemented("delete_image"))
    }
}
