//! A buffer for accumulating rollouts before a training step.

use std::collections::HashMap;

use super::types::Rollout;

/// Holds the rollouts collected for one training step.
///
/// Supports the operations the pipeline needs: accumulation, grouping by
/// group id, and draining for consumption. Discarded after the step.
#[derive(Debug, Clone, Default)]
pub struct RolloutPool {
    rollouts: Vec<Rollout>,
}

impl RolloutPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            rollouts: Vec::new(),
        }
    }

    /// Create a pool pre-allocated for `capacity` rollouts.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rollouts: Vec::with_capacity(capacity),
        }
    }

    /// Number of rollouts currently in the pool.
    pub fn len(&self) -> usize {
        self.rollouts.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.rollouts.is_empty()
    }

    /// Push a single rollout.
    pub fn push(&mut self, rollout: Rollout) {
        self.rollouts.push(rollout);
    }

    /// Extend the pool with an iterator of rollouts.
    pub fn extend(&mut self, iter: impl IntoIterator<Item = Rollout>) {
        self.rollouts.extend(iter);
    }

    /// Drain all rollouts, leaving the pool empty.
    pub fn drain(&mut self) -> Vec<Rollout> {
        std::mem::take(&mut self.rollouts)
    }

    /// Slice view of all rollouts.
    pub fn as_slice(&self) -> &[Rollout] {
        &self.rollouts
    }

    /// Indices of the pool's rollouts keyed by group id, preserving the
    /// original order within each group.
    pub fn group_indices(&self) -> HashMap<String, Vec<usize>> {
        group_indices(&self.rollouts)
    }
}

/// Group rollout indices by group id, preserving input order within groups.
pub fn group_indices(rollouts: &[Rollout]) -> HashMap<String, Vec<usize>> {
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, r) in rollouts.iter().enumerate() {
        groups.entry(r.group_id.clone()).or_default().push(i);
    }
    groups
}
