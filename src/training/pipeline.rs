//! Reward pipeline orchestration.
//!
//! One training step flows through four phases:
//!
//! 1. **Scoring** -- every enabled reward source scores every rollout;
//!    external failures become invalid markers, never errors.
//! 2. **Credit assignment** -- each score is expanded into a per-token credit
//!    array; shape mismatches exclude the offending rollout only.
//! 3. **Advantage estimation** -- blended credits minus the leave-one-out
//!    group baseline, with KL penalty and optional normalization.
//! 4. **Batch packing** -- rollouts plus advantages are packed into
//!    token-budget micro-batches for the optimizer.
//!
//! The pipeline is deliberately thin about training itself: it produces
//! batches and a step report, and the [`run`] loop hands them to an
//! [`OptimizerSink`] supplied by the caller.
//!
//! [`run`]: RewardPipeline::run

use anyhow::Context;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::reward::{
    JudgeAdapter, PrmAdapter, ScoringPhase, StepScorer, Verifier, VerifierAdapter,
};
use crate::rollout::{
    BatchEntry, CreditArray, ExcludedRollout, Rollout, RolloutPool, StepReport, TokenBatch,
};

use super::advantage::{AdvantageEstimator, CreditSet};
use super::credit::assign_credit;
use super::scheduler::BatchScheduler;

/// Everything one training step produces for the optimizer.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub batches: Vec<TokenBatch>,
    pub report: StepReport,
}

/// Supplies rollouts to the training loop, one step's worth at a time.
#[allow(async_fn_in_trait)]
pub trait RolloutSource {
    /// Next step's rollouts, or `None` when the source is exhausted.
    async fn next_rollouts(&mut self) -> anyhow::Result<Option<Vec<Rollout>>>;
}

/// A filled pool is a one-step source: draining it yields all of its
/// rollouts, then the source is exhausted.
impl RolloutSource for RolloutPool {
    async fn next_rollouts(&mut self) -> anyhow::Result<Option<Vec<Rollout>>> {
        let rollouts = self.drain();
        Ok((!rollouts.is_empty()).then_some(rollouts))
    }
}

/// Consumes packed batches, e.g. a policy optimizer or a file writer.
#[allow(async_fn_in_trait)]
pub trait OptimizerSink {
    async fn apply(&mut self, output: &StepOutput) -> anyhow::Result<()>;

    /// Called after steps that hit the configured checkpoint interval.
    async fn checkpoint(&mut self, step: usize) -> anyhow::Result<()> {
        let _ = step;
        Ok(())
    }
}

/// The reward aggregation pipeline for one training job.
pub struct RewardPipeline {
    config: PipelineConfig,
    scoring: ScoringPhase,
    estimator: AdvantageEstimator,
    scheduler: BatchScheduler,
}

impl std::fmt::Debug for RewardPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewardPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RewardPipeline {
    /// Build the pipeline, wiring up the enabled reward sources.
    ///
    /// Fails with a configuration error when the config is invalid or an
    /// enabled local source (verifier, PRM) was not supplied; nothing may run
    /// on a bad config.
    pub fn new(
        config: PipelineConfig,
        verifier: Option<Box<dyn Verifier>>,
        step_scorer: Option<Box<dyn StepScorer>>,
    ) -> Result<Self> {
        config.validate()?;

        let verifier = match (config.sources.verifier_enabled, verifier) {
            (true, Some(v)) => Some(VerifierAdapter::new(v)),
            (true, None) => {
                return Err(PipelineError::Configuration(
                    "verifier source enabled but no verifier supplied".into(),
                ))
            }
            (false, _) => None,
        };
        let prm = match (config.sources.prm_enabled, step_scorer) {
            (true, Some(s)) => Some(PrmAdapter::new(s)),
            (true, None) => {
                return Err(PipelineError::Configuration(
                    "PRM source enabled but no step scorer supplied".into(),
                ))
            }
            (false, _) => None,
        };
        let judge = config
            .sources
            .judge_enabled
            .then(|| JudgeAdapter::new(config.judge.clone()));

        let scoring = ScoringPhase::new(verifier, prm, judge);
        let estimator = AdvantageEstimator::new(config.advantage.clone());
        let scheduler = BatchScheduler::new(config.scheduler.clone());

        Ok(Self {
            config,
            scoring,
            estimator,
            scheduler,
        })
    }

    /// Process one training step's rollouts into packed batches.
    ///
    /// Per-rollout failures (shape mismatches, invalid external scores)
    /// exclude that rollout and are recorded in the report; the step itself
    /// fails only when it was empty or every rollout ended up excluded.
    pub async fn process_step(&self, rollouts: Vec<Rollout>) -> Result<StepOutput> {
        if rollouts.is_empty() {
            return Err(PipelineError::EmptyStep);
        }

        let scores = self.scoring.score_all(&rollouts).await;

        // Credit assignment per rollout and source.
        let mut blended: Vec<CreditArray> = Vec::with_capacity(rollouts.len());
        let mut excluded: Vec<ExcludedRollout> = Vec::new();

        for (rollout, rollout_scores) in rollouts.iter().zip(&scores) {
            let len = rollout.response_len();
            let mut reason: Option<String> = None;
            let mut set = CreditSet::default();

            let slots = [
                (&rollout_scores.verifier, &mut set.verifier),
                (&rollout_scores.prm, &mut set.prm),
                (&rollout_scores.judge, &mut set.judge),
            ];
            for (score, slot) in slots {
                let Some(score) = score else { continue };
                match assign_credit(&self.config.credit, rollout, score) {
                    Ok(credit) => *slot = Some(credit),
                    Err(e) => {
                        warn!(rollout_id = %rollout.id, error = %e, "excluding rollout");
                        reason.get_or_insert_with(|| e.to_string());
                        *slot = Some(CreditArray::excluded(len));
                    }
                }
            }

            let credit = self.estimator.blend(&set, len);
            if credit.excluded && reason.is_none() {
                let invalid: Vec<&str> = [
                    (&rollout_scores.verifier, "verifier"),
                    (&rollout_scores.prm, "prm"),
                    (&rollout_scores.judge, "judge"),
                ]
                .into_iter()
                .filter(|(s, _)| s.as_ref().is_some_and(|s| !s.valid))
                .map(|(_, name)| name)
                .collect();
                reason = Some(if invalid.is_empty() {
                    "no reward source produced a score".into()
                } else {
                    format!("invalid score from: {}", invalid.join(", "))
                });
            }
            if let Some(reason) = reason {
                excluded.push(ExcludedRollout {
                    rollout_id: rollout.id.clone(),
                    reason,
                });
            }
            blended.push(credit);
        }

        if blended.iter().all(|c| c.excluded) {
            return Err(PipelineError::AllScoresInvalid {
                rollouts: rollouts.len(),
            });
        }

        // Advantage estimation over the whole step.
        let estimate = self.estimator.estimate(&rollouts, &blended);

        // Pack into token-budget batches.
        let plan = self.scheduler.pack(&rollouts);
        let mut advantages: Vec<Option<Vec<f64>>> =
            estimate.advantages.into_iter().map(Some).collect();
        let batches: Vec<TokenBatch> = plan
            .batches
            .iter()
            .map(|b| TokenBatch {
                entries: b
                    .indices
                    .iter()
                    .map(|&i| BatchEntry {
                        rollout: rollouts[i].clone(),
                        advantages: advantages[i].take().unwrap_or_default(),
                    })
                    .collect(),
                total_tokens: b.total_tokens,
                oversized: b.oversized,
            })
            .collect();

        let report = StepReport {
            num_rollouts: rollouts.len(),
            num_batches: batches.len(),
            oversized_batches: plan.num_oversized(),
            excluded,
            mean_credit: estimate.mean_credit,
            mean_advantage: estimate.mean_advantage,
            advantage_std: estimate.advantage_std,
            mean_kl: estimate.mean_kl,
        };

        info!(
            rollouts = report.num_rollouts,
            batches = report.num_batches,
            oversized = report.oversized_batches,
            excluded = report.excluded.len(),
            mean_credit = report.mean_credit,
            mean_advantage = report.mean_advantage,
            mean_kl = report.mean_kl,
            "training step processed"
        );

        Ok(StepOutput { batches, report })
    }

    /// Whether a checkpoint signal fires after the given 1-indexed step.
    pub fn should_checkpoint(&self, step: usize) -> bool {
        self.config.checkpoint_interval > 0 && step % self.config.checkpoint_interval == 0
    }

    /// Drive the training loop: pull rollouts from `source`, process each
    /// step, and hand the output to `sink` until the source is exhausted.
    ///
    /// Returns the number of steps completed.
    pub async fn run<S, K>(&self, source: &mut S, sink: &mut K) -> anyhow::Result<usize>
    where
        S: RolloutSource,
        K: OptimizerSink,
    {
        let mut step = 0usize;

        while let Some(rollouts) = source
            .next_rollouts()
            .await
            .context("rollout source failed")?
        {
            step += 1;
            let output = self
                .process_step(rollouts)
                .await
                .with_context(|| format!("step {step} failed"))?;

            sink.apply(&output)
                .await
                .with_context(|| format!("optimizer sink rejected step {step}"))?;

            if self.should_checkpoint(step) {
                info!(step, "checkpoint interval reached");
                sink.checkpoint(step)
                    .await
                    .with_context(|| format!("checkpoint after step {step} failed"))?;
            }
        }

        info!(steps = step, "rollout source exhausted, training loop finished");
        Ok(step)
    }
}
