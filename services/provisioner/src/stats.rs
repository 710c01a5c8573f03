//! Counters for launch and delete outcomes.
//!
//! Owned by the provider loop that produces them; created at provider
//! start, discarded at provider stop, reported through tracing.

use fleet_coordination::NodeState;

/// Terminal launch outcomes, bucketed by failure classification.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LaunchStats {
    pub ready: u64,
    pub failed: u64,
    pub aborted: u64,
}

impl LaunchStats {
    pub fn record(&mut self, state: NodeState) {
        match state {
            NodeState::Ready => self.ready += 1,
            NodeState::Aborted => self.aborted += 1,
            _ => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.ready + self.failed + self.aborted
    }
}

/// Per-provider operation counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProviderStats {
    pub launches: LaunchStats,
    pub deletes: u64,
    pub delete_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_stats_buckets() {
        let mut stats = LaunchStats::default();
        stats.record(NodeState::Ready);
        stats.record(NodeState::Ready);
        stats.record(NodeState::Failed);
        stats.record(NodeState::Aborted);

        assert_eq!(stats.ready, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.aborted, 1);
        assert_eq!(stats.total(), 4);
    }
}
