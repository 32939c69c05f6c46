//! Process reward model (PRM) adapter.
//!
//! The PRM itself is an external model (a forward pass of a separate scoring
//! network); this module treats it as a black-box [`StepScorer`] with a
//! declared micro-batch size and maximum sequence length, mirroring the
//! per-worker contracts of the surrounding training job.

use anyhow::Result;
use tracing::warn;

use crate::rollout::{RewardScore, RewardSource, Rollout};

use super::RewardAdapter;

/// Black-box scorer producing one score per reasoning step.
pub trait StepScorer: Send + Sync {
    /// How many rollouts the scorer wants per forward pass.
    fn microbatch_size(&self) -> usize {
        8
    }

    /// Maximum sequence length (prompt + response tokens) the scorer accepts.
    fn max_tokens(&self) -> usize {
        16384
    }

    /// Score each step of the response. Must return exactly one score per
    /// entry in `boundaries`.
    fn score_steps(
        &self,
        prompt_tokens: &[u32],
        response_tokens: &[u32],
        boundaries: &[usize],
    ) -> Result<Vec<f64>>;
}

/// Wraps a closure as a [`StepScorer`] with default batching hints.
pub struct FnStepScorer<F>(pub F);

impl<F> StepScorer for FnStepScorer<F>
where
    F: Fn(&[u32], &[u32], &[usize]) -> Result<Vec<f64>> + Send + Sync,
{
    fn score_steps(
        &self,
        prompt_tokens: &[u32],
        response_tokens: &[u32],
        boundaries: &[usize],
    ) -> Result<Vec<f64>> {
        (self.0)(prompt_tokens, response_tokens, boundaries)
    }
}

/// Adapter presenting a [`StepScorer`] as a step-scoped reward source.
///
/// Scoring failures and contract violations (no step boundaries, sequence
/// too long) are downgraded to invalid markers so one bad rollout never
/// aborts its siblings.
pub struct PrmAdapter {
    scorer: Box<dyn StepScorer>,
}

impl PrmAdapter {
    pub fn new(scorer: Box<dyn StepScorer>) -> Self {
        Self { scorer }
    }

    /// Micro-batch size the scoring phase should chunk rollouts by.
    pub fn microbatch_size(&self) -> usize {
        self.scorer.microbatch_size()
    }
}

impl RewardAdapter for PrmAdapter {
    fn source(&self) -> RewardSource {
        RewardSource::Prm
    }

    async fn score(&self, rollout: &Rollout) -> RewardScore {
        if rollout.step_boundaries.is_empty() {
            warn!(rollout_id = %rollout.id, "PRM scoring requested but rollout has no step boundaries");
            return RewardScore::invalid(RewardSource::Prm);
        }
        if rollout.total_tokens() > self.scorer.max_tokens() {
            warn!(
                rollout_id = %rollout.id,
                tokens = rollout.total_tokens(),
                max = self.scorer.max_tokens(),
                "rollout exceeds PRM max sequence length"
            );
            return RewardScore::invalid(RewardSource::Prm);
        }

        match self.scorer.score_steps(
            &rollout.prompt_tokens,
            &rollout.response_tokens,
            &rollout.step_boundaries,
        ) {
            Ok(scores) => RewardScore::steps(RewardSource::Prm, scores),
            Err(e) => {
                warn!(rollout_id = %rollout.id, error = %e, "PRM scoring failed");
                RewardScore::invalid(RewardSource::Prm)
            }
        }
    }
}
