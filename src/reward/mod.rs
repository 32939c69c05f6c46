//! Reward source adapters: verifier, process reward model, LLM-as-judge.
//!
//! Each adapter turns a rollout into a [`RewardScore`] and never raises on a
//! transient failure; external-service adapters return an explicit invalid
//! marker instead. The [`ScoringPhase`] fans scoring out across the rollouts
//! of a step, with judge calls bounded by a configured concurrency.

pub mod judge;
pub mod prm;
pub mod verifier;

use futures::{stream, StreamExt};
use tracing::debug;

use crate::rollout::{RewardScore, RewardSource, Rollout};

pub use judge::JudgeAdapter;
pub use prm::{FnStepScorer, PrmAdapter, StepScorer};
pub use verifier::{FnVerifier, Verifier, VerifierAdapter};

/// Uniform interface over the three reward producers.
///
/// `score` is infallible by contract: adapters recover from their own
/// failures by returning [`RewardScore::invalid`].
#[allow(async_fn_in_trait)]
pub trait RewardAdapter: Send + Sync {
    /// Which producer this adapter represents.
    fn source(&self) -> RewardSource;

    /// Score one rollout.
    async fn score(&self, rollout: &Rollout) -> RewardScore;
}

/// The reward signals collected for one rollout, one slot per enabled source.
#[derive(Debug, Clone, Default)]
pub struct RolloutScores {
    pub verifier: Option<RewardScore>,
    pub prm: Option<RewardScore>,
    pub judge: Option<RewardScore>,
}

impl RolloutScores {
    /// True when every present score is invalid (or no source produced one).
    pub fn all_invalid(&self) -> bool {
        [&self.verifier, &self.prm, &self.judge]
            .into_iter()
            .flatten()
            .all(|s| !s.valid)
            && (self.verifier.is_some() || self.prm.is_some() || self.judge.is_some())
    }

    /// True when any present score is invalid.
    pub fn any_invalid(&self) -> bool {
        [&self.verifier, &self.prm, &self.judge]
            .into_iter()
            .flatten()
            .any(|s| !s.valid)
    }
}

/// Runs the reward-computation phase for one training step.
///
/// Owns the adapter resources (including the judge's HTTP connection pool)
/// for the lifetime of the phase; dropping the phase releases them.
pub struct ScoringPhase {
    verifier: Option<VerifierAdapter>,
    prm: Option<PrmAdapter>,
    judge: Option<JudgeAdapter>,
}

impl ScoringPhase {
    pub fn new(
        verifier: Option<VerifierAdapter>,
        prm: Option<PrmAdapter>,
        judge: Option<JudgeAdapter>,
    ) -> Self {
        Self {
            verifier,
            prm,
            judge,
        }
    }

    /// Score every rollout with every enabled source.
    ///
    /// Verifier and PRM scoring are local, CPU-bound transforms and run
    /// in-line (the PRM in its declared micro-batches). Judge calls are the
    /// only suspension points: they fan out concurrently, order-preserving,
    /// bounded by the adapter's configured concurrency, and a failed call
    /// invalidates only its own rollout's judge slot.
    pub async fn score_all(&self, rollouts: &[Rollout]) -> Vec<RolloutScores> {
        let mut scores: Vec<RolloutScores> = vec![RolloutScores::default(); rollouts.len()];

        if let Some(verifier) = &self.verifier {
            for (i, rollout) in rollouts.iter().enumerate() {
                scores[i].verifier = Some(verifier.score(rollout).await);
            }
        }

        if let Some(prm) = &self.prm {
            let microbatch = prm.microbatch_size().max(1);
            for (chunk_idx, chunk) in rollouts.chunks(microbatch).enumerate() {
                debug!(chunk = chunk_idx, size = chunk.len(), "scoring PRM micro-batch");
                for (j, rollout) in chunk.iter().enumerate() {
                    scores[chunk_idx * microbatch + j].prm = Some(prm.score(rollout).await);
                }
            }
        }

        if let Some(judge) = &self.judge {
            let verdicts: Vec<RewardScore> =
                stream::iter(rollouts.iter().map(|r| judge.score(r)))
                    .buffered(judge.max_concurrency())
                    .collect()
                    .await;
            for (i, verdict) in verdicts.into_iter().enumerate() {
                scores[i].judge = Some(verdict);
            }
        }

        scores
    }
}
