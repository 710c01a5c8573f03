//! Min-ready capacity planning.
//!
//! Computes how many idle nodes of each label should be pre-built, and
//! where, by running the proportional allocation pass over the current
//! pool capacities. Pure: takes a config snapshot and the current node
//! listing, returns a plan. The embedding scheduler decides when to act
//! on it.

use std::collections::HashMap;

use fleet_allocation::Allocation;
use fleet_coordination::Node;

use crate::config::Config;

/// One planned pre-build: `count` nodes of `label` in `pool` at
/// `provider`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedNode {
    pub provider: String,
    pub pool: String,
    pub label: String,
    pub count: u64,
}

/// Distribute each label's min-ready deficit across the pools able to
/// supply it, in proportion to their remaining capacity.
pub fn plan_min_ready(config: &Config, nodes: &[Node]) -> Vec<PlannedNode> {
    // Idle (unallocated, non-failed) node counts per label.
    let mut idle: HashMap<&str, u64> = HashMap::new();
    for node in nodes {
        if node.allocated_to.is_none() && node.state.counts_against_quota() {
            *idle.entry(node.label.as_str()).or_default() += 1;
        }
    }

    // Node counts per (provider, pool), for capacity math.
    let mut pool_usage: HashMap<(&str, &str), f64> = HashMap::new();
    for node in nodes {
        if node.state.counts_against_quota() {
            *pool_usage
                .entry((node.provider.as_str(), node.pool.as_str()))
                .or_default() += 1.0;
        }
    }

    // Each label's floor is the highest min_ready any pool declares.
    let mut floors: HashMap<&str, u32> = HashMap::new();
    for provider in &config.providers {
        for pool in &provider.pools {
            for label in &pool.labels {
                let floor = floors.entry(label.name.as_str()).or_default();
                *floor = (*floor).max(label.min_ready);
            }
        }
    }

    let mut total_deficit = 0.0;
    let mut deficits: Vec<(&str, f64)> = Vec::new();
    for (label, floor) in &floors {
        let have = idle.get(label).copied().unwrap_or(0);
        let deficit = f64::from(*floor) - have as f64;
        if deficit > 0.0 {
            deficits.push((*label, deficit));
            total_deficit += deficit;
        }
    }
    if deficits.is_empty() {
        return Vec::new();
    }
    // Deterministic request order regardless of map iteration.
    deficits.sort_by(|a, b| a.0.cmp(b.0));

    let mut pass = Allocation::new();
    let mut providers = Vec::new();
    for provider in &config.providers {
        for pool in &provider.pools {
            let used = pool_usage
                .get(&(provider.name.as_str(), pool.name.as_str()))
                .copied()
                .unwrap_or(0.0);
            // An uncapped pool can absorb the entire deficit by itself.
            let available = match pool.max_servers {
                Some(max) => (max - used).max(0.0),
                None => total_deficit,
            };
            let id = pass.add_provider(&format!("{}/{}", provider.name, pool.name), available);
            providers.push((id, provider, pool));
        }
    }

    for (label, deficit) in deficits {
        let request = pass.add_request(label, deficit);
        for (provider_id, _, pool) in &providers {
            if pool.label(label).is_some() {
                pass.register(request, *provider_id);
            }
        }
    }

    for (provider_id, _, _) in &providers {
        pass.make_grants(*provider_id);
    }

    let mut plan = Vec::new();
    for (provider_id, provider, pool) in &providers {
        for (request, count) in pass.provider_grants(*provider_id) {
            if count == 0 {
                continue;
            }
            plan.push(PlannedNode {
                provider: provider.name.clone(),
                pool: pool.name.clone(),
                label: pass.request_label(request).to_string(),
                count,
            });
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    use fleet_coordination::NodeState;

    fn config(raw: &str) -> Config {
        Config::from_str(raw).unwrap()
    }

    fn idle_node(provider: &str, pool: &str, label: &str) -> Node {
        let mut node = Node::new(provider, pool, label);
        node.state = NodeState::Ready;
        node
    }

    const TWO_PROVIDERS: &str = r#"
        [[providers]]
        name = "provider1"
        driver = "mock"

        [[providers.pools]]
        name = "main"
        max_servers = 10.0

        [[providers.pools.labels]]
        name = "label1"
        image = "img"
        min_ready = 4

        [[providers.pools.labels]]
        name = "label2"
        image = "img"
        min_ready = 4

        [[providers]]
        name = "provider2"
        driver = "mock"

        [[providers.pools]]
        name = "main"
        max_servers = 10.0

        [[providers.pools.labels]]
        name = "label1"
        image = "img"
        min_ready = 4
    "#;

    #[test]
    fn test_shared_and_exclusive_labels_split() {
        let plan = plan_min_ready(&config(TWO_PROVIDERS), &[]);

        let count = |provider: &str, label: &str| {
            plan.iter()
                .find(|p| p.provider == provider && p.label == label)
                .map(|p| p.count)
                .unwrap_or(0)
        };
        // label2 is exclusive to provider1 and is granted there first;
        // label1 tops up from provider2.
        assert_eq!(count("provider1", "label2"), 2);
        assert_eq!(count("provider1", "label1"), 2);
        assert_eq!(count("provider2", "label1"), 2);
    }

    #[test]
    fn test_existing_idle_nodes_reduce_deficit() {
        let nodes = vec![
            idle_node("provider1", "main", "label1"),
            idle_node("provider1", "main", "label1"),
            idle_node("provider1", "main", "label1"),
            idle_node("provider1", "main", "label1"),
        ];
        let plan = plan_min_ready(&config(TWO_PROVIDERS), &nodes);
        assert!(plan.iter().all(|p| p.label != "label1"));
        assert!(plan.iter().any(|p| p.label == "label2"));
    }

    #[test]
    fn test_allocated_nodes_do_not_satisfy_the_floor() {
        let mut node = idle_node("provider1", "main", "label2");
        node.allocated_to = Some(7);
        let plan = plan_min_ready(&config(TWO_PROVIDERS), &[node]);
        let label2_total: u64 = plan
            .iter()
            .filter(|p| p.label == "label2")
            .map(|p| p.count)
            .sum();
        // One node exists but is spoken for; it still counts against the
        // pool's capacity, shifting label2's share down.
        assert!(label2_total >= 1);
    }

    #[test]
    fn test_no_deficit_means_empty_plan() {
        let raw = r#"
            [[providers]]
            name = "provider1"
            driver = "mock"

            [[providers.pools]]
            name = "main"

            [[providers.pools.labels]]
            name = "label1"
            image = "img"
        "#;
        assert!(plan_min_ready(&config(raw), &[]).is_empty());
    }

    #[test]
    fn test_uncapped_pool_absorbs_whole_deficit() {
        let raw = r#"
            [[providers]]
            name = "provider1"
            driver = "mock"

            [[providers.pools]]
            name = "main"

            [[providers.pools.labels]]
            name = "label1"
            image = "img"
            min_ready = 6
        "#;
        let plan = plan_min_ready(&config(raw), &[]);
        assert_eq!(
            plan,
            vec![PlannedNode {
                provider: "provider1".to_string(),
                pool: "main".to_string(),
                label: "label1".to_string(),
                count: 6,
            }]
        );
    }
}
