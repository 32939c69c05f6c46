//! Error taxonomy for the reward pipeline.
//!
//! Per-rollout failures (shape mismatches, unavailable judge scores) are
//! recovered locally and never abort sibling rollouts; only configuration
//! errors and systemic failures (every score in a step invalid) propagate to
//! the training loop.

use thiserror::Error;

/// Errors surfaced by the reward aggregation pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A step-scoped reward's score count disagrees with the rollout's
    /// step-boundary count. Fatal for that rollout only; the pipeline excludes
    /// it from the step instead of truncating or padding.
    #[error(
        "rollout {rollout_id}: {scores} step scores for {boundaries} step boundaries"
    )]
    ShapeMismatch {
        rollout_id: String,
        scores: usize,
        boundaries: usize,
    },

    /// The configuration is invalid. Raised before any part of a training
    /// step runs.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Every rollout in the step ended up excluded (all reward sources
    /// invalid). There is no gradient signal left, so the step fails as a
    /// whole.
    #[error("all {rollouts} rollouts in the step have invalid reward scores")]
    AllScoresInvalid { rollouts: usize },

    /// The step was handed an empty rollout list.
    #[error("training step received no rollouts")]
    EmptyStep,
}

/// Convenience alias used throughout the core modules.
pub type Result<T> = std::result::Result<T, PipelineError>;
