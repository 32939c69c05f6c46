//! Core rollout data types used throughout the reward pipeline.
//!
//! These types capture everything the reward adapters, credit assignment
//! engine, advantage estimator, and batch scheduler need to know about one
//! sampled trajectory.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Rollout
// ---------------------------------------------------------------------------

/// One sampled (prompt, generated-sequence) trajectory from the policy.
///
/// Immutable once collected: the pipeline reads it, derives credit and
/// advantage arrays, and releases it after the batch is consumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rollout {
    /// Unique identifier (UUID v4).
    pub id: String,
    /// The prompt text (used by the verifier and judge adapters).
    pub prompt: String,
    /// The generated text (used by the verifier and judge adapters).
    pub response: String,
    /// Prompt token ids.
    pub prompt_tokens: Vec<u32>,
    /// Generated token ids. All per-token arrays align with this sequence.
    pub response_tokens: Vec<u32>,
    /// End offsets of reasoning steps within `response_tokens`, exclusive and
    /// strictly increasing. Empty when the rollout has no step structure.
    pub step_boundaries: Vec<usize>,
    /// Rollouts sampled from the same prompt under the same policy share a
    /// group id; the leave-one-out baseline operates within a group.
    pub group_id: String,
    /// Whether generation finished naturally (false = truncated).
    pub finished: bool,
    /// Per-token log probabilities under the current policy, if available.
    pub policy_log_probs: Option<Vec<f64>>,
    /// Per-token log probabilities under the frozen reference policy.
    pub ref_log_probs: Option<Vec<f64>>,
}

impl Rollout {
    /// Number of generated tokens.
    pub fn response_len(&self) -> usize {
        self.response_tokens.len()
    }

    /// Total token count (prompt + generation), the quantity the batch
    /// scheduler budgets against.
    pub fn total_tokens(&self) -> usize {
        self.prompt_tokens.len() + self.response_tokens.len()
    }

    /// Number of reasoning steps (0 when no boundaries were recorded).
    pub fn num_steps(&self) -> usize {
        self.step_boundaries.len()
    }
}

// ---------------------------------------------------------------------------
// Reward scores
// ---------------------------------------------------------------------------

/// Identity of the producer that emitted a reward score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardSource {
    Verifier,
    Prm,
    Judge,
}

/// Scope and payload of a reward score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreValue {
    /// One scalar for the whole rollout.
    Sequence(f64),
    /// One scalar per step boundary.
    Step(Vec<f64>),
}

/// A reward signal for one rollout from one producer.
///
/// Failed external calls are marked `valid: false` rather than defaulted to
/// zero, so downstream statistics can exclude them explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardScore {
    pub source: RewardSource,
    pub value: ScoreValue,
    pub valid: bool,
}

impl RewardScore {
    /// A valid sequence-scoped score.
    pub fn sequence(source: RewardSource, value: f64) -> Self {
        Self {
            source,
            value: ScoreValue::Sequence(value),
            valid: true,
        }
    }

    /// A valid step-scoped score.
    pub fn steps(source: RewardSource, values: Vec<f64>) -> Self {
        Self {
            source,
            value: ScoreValue::Step(values),
            valid: true,
        }
    }

    /// An explicit invalid marker (e.g. judge timed out after all retries).
    pub fn invalid(source: RewardSource) -> Self {
        Self {
            source,
            value: ScoreValue::Sequence(0.0),
            valid: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Credit array
// ---------------------------------------------------------------------------

/// Dense per-token credit derived from a reward score.
///
/// `values.len()` always equals the rollout's generated-token count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditArray {
    /// One credit value per generated token.
    pub values: Vec<f64>,
    /// The scalar the strategy recovers: the original sequence score for
    /// gamma-decay, the final-token credit for the min forms. Used by the
    /// leave-one-out baseline.
    pub score: f64,
    /// True when the underlying score was invalid. Excluded credit arrays are
    /// all zeros and are omitted from baseline and normalization statistics.
    pub excluded: bool,
}

impl CreditArray {
    /// A zeroed credit array for a rollout whose score was invalid.
    pub fn excluded(len: usize) -> Self {
        Self {
            values: vec![0.0; len],
            score: 0.0,
            excluded: true,
        }
    }

    /// Sum of per-token credit.
    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// One rollout together with its per-token advantage array, aligned
/// index-for-index with `rollout.response_tokens`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub rollout: Rollout,
    pub advantages: Vec<f64>,
}

/// An ordered micro-batch respecting the per-worker token budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBatch {
    pub entries: Vec<BatchEntry>,
    /// Total token count (prompts + generations) across entries.
    pub total_tokens: usize,
    /// True when this batch holds a single rollout that alone exceeds the
    /// budget. Surfaced as a warning, never a fatal error.
    pub oversized: bool,
}

// ---------------------------------------------------------------------------
// Step report
// ---------------------------------------------------------------------------

/// Why a rollout was dropped from the step's gradient signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcludedRollout {
    pub rollout_id: String,
    pub reason: String,
}

/// Aggregate outcome of one training step, for logging and monitoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepReport {
    /// Number of rollouts handed to the step.
    pub num_rollouts: usize,
    /// Number of output batches.
    pub num_batches: usize,
    /// How many batches exceeded the token budget on their own.
    pub oversized_batches: usize,
    /// Rollouts excluded from the baseline (invalid scores, shape mismatches).
    pub excluded: Vec<ExcludedRollout>,
    /// Mean blended credit across non-excluded rollouts.
    pub mean_credit: f64,
    /// Mean per-token advantage across non-excluded rollouts.
    pub mean_advantage: f64,
    /// Standard deviation of per-token advantages.
    pub advantage_std: f64,
    /// Mean per-token KL penalty applied (0 when log probs were absent).
    pub mean_kl: f64,
}
