//! Quota-aware admission control.
//!
//! Before a request is accepted, the pool worker checks two independent
//! budgets:
//!
//! - **Cloud**: the adapter's account-wide limits minus everything already
//!   consuming them. "Consuming" includes instances visible to the
//!   provider but untracked by the coordination service (leaked or created
//!   out-of-band), so true cloud quota is never exceeded even when local
//!   bookkeeping is incomplete.
//! - **Pool**: the pool's configured caps (unbounded by default) minus
//!   quota already committed to nodes in this pool.
//!
//! Both must pass. Per-label quota lookups are cached for the life of the
//! owning worker; the cache is invalidated only by restart or config
//! change.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use fleet_coordination::Coordinator;
use fleet_quota::{QuotaInformation, INSTANCES};

use crate::adapter::{Adapter, AdapterError};
use crate::config::{PoolConfig, PoolLabelConfig, ProviderConfig};

/// Computes remaining quota at cloud and pool granularity.
pub struct AdmissionControl {
    provider: Arc<ProviderConfig>,
    pool: Arc<PoolConfig>,
    adapter: Arc<dyn Adapter>,
    coordinator: Arc<dyn Coordinator>,
    label_quota_cache: HashMap<String, QuotaInformation>,
}

impl AdmissionControl {
    pub fn new(
        provider: Arc<ProviderConfig>,
        pool: Arc<PoolConfig>,
        adapter: Arc<dyn Adapter>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Self {
        Self {
            provider,
            pool,
            adapter,
            coordinator,
            label_quota_cache: HashMap::new(),
        }
    }

    /// Resources one node of this label consumes, cached per label.
    ///
    /// Adapters without quota support fall back to a one-instance
    /// estimate.
    pub async fn label_quota(&mut self, label: &PoolLabelConfig) -> QuotaInformation {
        if let Some(cached) = self.label_quota_cache.get(&label.name) {
            return cached.clone();
        }
        let quota = match self.adapter.label_quota(label).await {
            Ok(quota) => quota,
            Err(AdapterError::NotImplemented(_)) => {
                QuotaInformation::zero().with_resource(INSTANCES, 1.0)
            }
            Err(e) => {
                warn!(label = %label.name, error = %e, "Label quota lookup failed");
                QuotaInformation::zero().with_resource(INSTANCES, 1.0)
            }
        };
        self.label_quota_cache
            .insert(label.name.clone(), quota.clone());
        quota
    }

    /// Total resources a set of labels would consume.
    pub async fn needed_for_labels(&mut self, labels: &[&PoolLabelConfig]) -> QuotaInformation {
        let mut needed = QuotaInformation::zero();
        for label in labels {
            let quota = self.label_quota(label).await;
            needed.add(&quota);
        }
        needed
    }

    /// True when both the cloud and the pool can absorb `needed`.
    pub async fn has_remaining_quota(&mut self, needed: &QuotaInformation) -> Result<bool> {
        Ok(self.has_provider_quota(needed).await? && self.has_pool_quota(needed).await?)
    }

    /// Cloud-granularity check against the adapter's account limits.
    async fn has_provider_quota(&mut self, needed: &QuotaInformation) -> Result<bool> {
        let mut remaining = match self.adapter.quota_limits().await {
            Ok(limits) => limits,
            Err(AdapterError::NotImplemented(_)) => QuotaInformation::unlimited(),
            Err(e) => return Err(e).context("quota limits lookup failed"),
        };

        let nodes = self
            .coordinator
            .list_nodes()
            .await
            .context("node listing failed")?;
        let mut tracked_external_ids: HashSet<String> = HashSet::new();
        for node in nodes
            .iter()
            .filter(|n| n.provider == self.provider.name && n.state.counts_against_quota())
        {
            remaining.subtract(&node_quota(node));
            if let Some(external_id) = &node.external_id {
                tracked_external_ids.insert(external_id.clone());
            }
        }

        // Instances the provider can see but the coordination service
        // cannot: leaked or created out-of-band. They consume real quota.
        let instances = self
            .adapter
            .list_instances()
            .await
            .context("instance listing failed")?;
        for instance in instances
            .iter()
            .filter(|i| !tracked_external_ids.contains(&i.external_id))
        {
            remaining.subtract(&instance.quota);
        }

        remaining.subtract(needed);
        let accepted = remaining.non_negative();
        if !accepted {
            debug!(
                provider = %self.provider.name,
                remaining = %remaining,
                "Cloud quota insufficient"
            );
        }
        Ok(accepted)
    }

    /// Pool-granularity check against configured caps.
    async fn has_pool_quota(&mut self, needed: &QuotaInformation) -> Result<bool> {
        let mut remaining = self.pool.limits();

        let nodes = self
            .coordinator
            .list_nodes()
            .await
            .context("node listing failed")?;
        for node in nodes.iter().filter(|n| {
            n.provider == self.provider.name
                && n.pool == self.pool.name
                && n.state.counts_against_quota()
        }) {
            remaining.subtract(&node_quota(node));
        }

        remaining.subtract(needed);
        let accepted = remaining.non_negative();
        if !accepted {
            debug!(
                provider = %self.provider.name,
                pool = %self.pool.name,
                remaining = %remaining,
                "Pool quota insufficient"
            );
        }
        Ok(accepted)
    }
}

/// A node's committed budget; nodes without a snapshot estimate as one
/// instance.
fn node_quota(node: &fleet_coordination::Node) -> QuotaInformation {
    node.quota
        .clone()
        .unwrap_or_else(|| QuotaInformation::zero().with_resource(INSTANCES, 1.0))
}
