//! Dynamic token-budget batch scheduler.
//!
//! Packs rollouts of uneven length into micro-batches whose total token count
//! (prompt + generation) stays within a per-worker budget. Greedy first-fit
//! over decreasing lengths, with a preference for placing a rollout into a
//! batch that already holds a member of its group. The plan is deterministic:
//! ties break on the original rollout index.

use std::cmp::Reverse;

use tracing::warn;

use crate::config::SchedulerConfig;
use crate::rollout::{group_indices, Rollout};

/// One batch in a packing plan, holding indices into the input slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedBatch {
    /// Indices of the packed rollouts, in placement order.
    pub indices: Vec<usize>,
    pub total_tokens: usize,
    /// A single rollout that alone exceeds the budget, isolated into its own
    /// batch so the caller can split or truncate it downstream.
    pub oversized: bool,
}

/// The complete packing of one step's rollouts.
#[derive(Debug, Clone, Default)]
pub struct PackPlan {
    pub batches: Vec<PackedBatch>,
}

impl PackPlan {
    pub fn num_oversized(&self) -> usize {
        self.batches.iter().filter(|b| b.oversized).count()
    }
}

pub struct BatchScheduler {
    config: SchedulerConfig,
}

impl BatchScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Pack `rollouts` into budget-respecting batches.
    ///
    /// Every input index appears in exactly one batch. Rollouts are placed
    /// longest-first; each goes into the first existing batch with room,
    /// preferring one already holding its group, else opens a new batch.
    /// An oversized rollout is isolated with a warning rather than rejected.
    pub fn pack(&self, rollouts: &[Rollout]) -> PackPlan {
        let budget = self.config.token_budget;

        // Sanity check against the configured rollouts-per-prompt count; a
        // disagreement usually means upstream sampling or exclusion dropped
        // group members, which weakens the leave-one-out baseline.
        for (group, members) in group_indices(rollouts) {
            if members.len() != self.config.group_size {
                warn!(
                    group = %group,
                    size = members.len(),
                    expected = self.config.group_size,
                    "observed group size differs from configured group_size"
                );
            }
        }

        let mut order: Vec<usize> = (0..rollouts.len()).collect();
        order.sort_by_key(|&i| (Reverse(rollouts[i].total_tokens()), i));

        let mut batches: Vec<PackedBatch> = Vec::new();

        for i in order {
            let tokens = rollouts[i].total_tokens();

            if tokens > budget {
                warn!(
                    rollout_id = %rollouts[i].id,
                    tokens,
                    budget,
                    "rollout exceeds token budget, isolating into its own batch"
                );
                batches.push(PackedBatch {
                    indices: vec![i],
                    total_tokens: tokens,
                    oversized: true,
                });
                continue;
            }

            let fits =
                |b: &PackedBatch| !b.oversized && b.total_tokens + tokens <= budget;
            let same_group = |b: &PackedBatch| {
                b.indices
                    .iter()
                    .any(|&j| rollouts[j].group_id == rollouts[i].group_id)
            };

            let slot = batches
                .iter()
                .position(|b| fits(b) && same_group(b))
                .or_else(|| batches.iter().position(&fits));

            match slot {
                Some(k) => {
                    batches[k].indices.push(i);
                    batches[k].total_tokens += tokens;
                }
                None => batches.push(PackedBatch {
                    indices: vec![i],
                    total_tokens: tokens,
                    oversized: false,
                }),
            }
        }

        PackPlan { batches }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rollout(id: &str, group: &str, tokens: usize) -> Rollout {
        Rollout {
            id: id.into(),
            prompt: String::new(),
            response: String::new(),
            prompt_tokens: Vec::new(),
            response_tokens: vec![0; tokens],
            step_boundaries: Vec::new(),
            group_id: group.into(),
            finished: true,
            policy_log_probs: None,
            ref_log_probs: None,
        }
    }

    fn scheduler(budget: usize) -> BatchScheduler {
        BatchScheduler::new(SchedulerConfig {
            token_budget: budget,
            ..SchedulerConfig::default()
        })
    }

    #[test]
    fn test_uniform_lengths_fill_batches() {
        // Budget 100, four rollouts of 40 tokens: two batches of two.
        let rollouts: Vec<Rollout> = (0..4)
            .map(|i| rollout(&format!("r{i}"), &format!("g{i}"), 40))
            .collect();

        let plan = scheduler(100).pack(&rollouts);
        assert_eq!(plan.batches.len(), 2);
        for b in &plan.batches {
            assert_eq!(b.indices.len(), 2);
            assert_eq!(b.total_tokens, 80);
            assert!(!b.oversized);
        }
    }

    #[test]
    fn test_every_rollout_packed_exactly_once() {
        let lengths = [55, 10, 80, 30, 5, 70, 25, 40];
        let rollouts: Vec<Rollout> = lengths
            .iter()
            .enumerate()
            .map(|(i, &t)| rollout(&format!("r{i}"), "g", t))
            .collect();

        let plan = scheduler(100).pack(&rollouts);
        let mut seen: Vec<usize> = plan
            .batches
            .iter()
            .flat_map(|b| b.indices.iter().copied())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..lengths.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_budget_respected_for_non_oversized() {
        let lengths = [90, 60, 50, 45, 30, 20, 10, 5];
        let rollouts: Vec<Rollout> = lengths
            .iter()
            .enumerate()
            .map(|(i, &t)| rollout(&format!("r{i}"), "g", t))
            .collect();

        let plan = scheduler(100).pack(&rollouts);
        for b in &plan.batches {
            assert!(b.total_tokens <= 100);
            let sum: usize = b.indices.iter().map(|&i| rollouts[i].total_tokens()).sum();
            assert_eq!(sum, b.total_tokens);
        }
    }

    #[test]
    fn test_oversized_rollout_isolated() {
        let rollouts = vec![
            rollout("big", "g", 150),
            rollout("a", "g", 40),
            rollout("b", "g", 40),
        ];

        let plan = scheduler(100).pack(&rollouts);
        assert_eq!(plan.num_oversized(), 1);

        let oversized = plan.batches.iter().find(|b| b.oversized).unwrap();
        assert_eq!(oversized.indices, vec![0]);
        // Nothing else shares the oversized batch.
        assert_eq!(oversized.indices.len(), 1);

        let regular = plan.batches.iter().find(|b| !b.oversized).unwrap();
        assert_eq!(regular.total_tokens, 80);
    }

    #[test]
    fn test_group_members_prefer_same_batch() {
        // Two groups of two; all four fit pairwise. Grouping preference
        // should co-locate group members even when a plain first-fit would
        // interleave them.
        let rollouts = vec![
            rollout("a0", "ga", 40),
            rollout("b0", "gb", 40),
            rollout("a1", "ga", 40),
            rollout("b1", "gb", 40),
        ];

        let plan = scheduler(100).pack(&rollouts);
        assert_eq!(plan.batches.len(), 2);
        for b in &plan.batches {
            let groups: Vec<&str> = b
                .indices
                .iter()
                .map(|&i| rollouts[i].group_id.as_str())
                .collect();
            assert_eq!(groups[0], groups[1]);
        }
    }

    #[test]
    fn test_group_colocation_yields_to_budget() {
        // Group members that cannot share a batch still get packed.
        let rollouts = vec![rollout("a0", "g", 70), rollout("a1", "g", 70)];

        let plan = scheduler(100).pack(&rollouts);
        assert_eq!(plan.batches.len(), 2);
        for b in &plan.batches {
            assert!(!b.oversized);
            assert_eq!(b.indices.len(), 1);
        }
    }

    #[test]
    fn test_mismatched_group_size_still_packs_everything() {
        // Configured for groups of 8, handed a group of 3: the scheduler
        // flags the mismatch but must still assign every rollout.
        let sched = BatchScheduler::new(SchedulerConfig {
            token_budget: 100,
            group_size: 8,
        });
        let rollouts: Vec<Rollout> = (0..3)
            .map(|i| rollout(&format!("r{i}"), "g", 30))
            .collect();

        let plan = sched.pack(&rollouts);
        let packed: usize = plan.batches.iter().map(|b| b.indices.len()).sum();
        assert_eq!(packed, 3);
        assert_eq!(plan.num_oversized(), 0);
    }

    #[test]
    fn test_deterministic_packing() {
        let lengths = [33, 33, 33, 50, 50, 17, 17, 90];
        let rollouts: Vec<Rollout> = lengths
            .iter()
            .enumerate()
            .map(|(i, &t)| rollout(&format!("r{i}"), &format!("g{}", i % 3), t))
            .collect();

        let sched = scheduler(100);
        let a = sched.pack(&rollouts);
        let b = sched.pack(&rollouts);
        assert_eq!(a.batches, b.batches);
    }

    #[test]
    fn test_longest_first_placement() {
        // Decreasing-length order packs tight: [60, 50, 40, 30] at budget 100
        // gives [60, 40] and [50, 30], not a 3-batch first-come split.
        let lengths = [30, 60, 50, 40];
        let rollouts: Vec<Rollout> = lengths
            .iter()
            .enumerate()
            .map(|(i, &t)| rollout(&format!("r{i}"), &format!("g{i}"), t))
            .collect();

        let plan = scheduler(100).pack(&rollouts);
        assert_eq!(plan.batches.len(), 2);
        assert_eq!(plan.batches[0].total_tokens, 100);
        assert_eq!(plan.batches[1].total_tokens, 80);
    }

    #[test]
    fn test_empty_input() {
        let plan = scheduler(100).pack(&[]);
        assert!(plan.batches.is_empty());
    }
}
