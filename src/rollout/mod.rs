//! Rollout data model: trajectories, reward scores, credit arrays, batches.

pub mod pool;
pub mod types;

pub use pool::{group_indices, RolloutPool};
pub use types::{
    BatchEntry, CreditArray, ExcludedRollout, RewardScore, RewardSource, Rollout, ScoreValue,
    StepReport, TokenBatch,
};
