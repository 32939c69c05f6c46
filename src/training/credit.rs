//! Credit assignment: mapping step- or sequence-level reward scores to dense
//! per-token credit arrays.
//!
//! Three interchangeable strategies, selected once at configuration load:
//!
//! - `gamma-decay` spreads a sequence score backward over the tokens with a
//!   per-position discount, normalized so the array always sums back to the
//!   original score.
//! - `strict-min-form` gives each token the minimum step score over the
//!   suffix of steps from its position to the end of the sequence: a chain is
//!   only as strong as its weakest remaining step.
//! - `soft-min(tau)` is the differentiable log-sum-exp relaxation of the
//!   same suffix minimum, converging to strict-min as tau approaches 0.
//!
//! Both min forms run a single backward suffix scan over the steps, O(n) per
//! rollout.

use crate::config::{CreditConfig, CreditStrategy};
use crate::error::{PipelineError, Result};
use crate::rollout::{CreditArray, RewardScore, Rollout, ScoreValue};

/// Map one reward score to a per-token credit array for `rollout`.
///
/// Invalid scores yield a zeroed array flagged excluded-from-baseline; a
/// step-score count that disagrees with the boundary count is a
/// [`PipelineError::ShapeMismatch`], never silently truncated or padded.
pub fn assign_credit(
    config: &CreditConfig,
    rollout: &Rollout,
    score: &RewardScore,
) -> Result<CreditArray> {
    let num_tokens = rollout.response_len();

    if !score.valid {
        return Ok(CreditArray::excluded(num_tokens));
    }

    match &score.value {
        ScoreValue::Sequence(v) => Ok(match config.strategy {
            CreditStrategy::GammaDecay => gamma_decay(*v, config.gamma, num_tokens),
            // With no step structure the whole sequence is one step, and both
            // min forms reduce to a uniform fill.
            CreditStrategy::StrictMin | CreditStrategy::SoftMin(_) => CreditArray {
                values: vec![*v; num_tokens],
                score: *v,
                excluded: false,
            },
        }),
        ScoreValue::Step(step_scores) => {
            if step_scores.len() != rollout.step_boundaries.len() {
                return Err(PipelineError::ShapeMismatch {
                    rollout_id: rollout.id.clone(),
                    scores: step_scores.len(),
                    boundaries: rollout.step_boundaries.len(),
                });
            }

            match config.strategy {
                CreditStrategy::GammaDecay => {
                    // The decay strategy only understands a terminal reward;
                    // collapse the step scores into one.
                    let total: f64 = step_scores.iter().sum();
                    Ok(gamma_decay(total, config.gamma, num_tokens))
                }
                CreditStrategy::StrictMin => {
                    let suffix = suffix_min(step_scores);
                    Ok(expand_steps(&suffix, &rollout.step_boundaries, num_tokens))
                }
                CreditStrategy::SoftMin(tau) => {
                    let suffix = suffix_softmin(step_scores, tau);
                    Ok(expand_steps(&suffix, &rollout.step_boundaries, num_tokens))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Spread `score` over `num_tokens` with weights gamma^(T-1-t), normalized so
/// the array sums to `score` exactly (for gamma = 1 this is a uniform fill).
fn gamma_decay(score: f64, gamma: f64, num_tokens: usize) -> CreditArray {
    if num_tokens == 0 {
        return CreditArray {
            values: Vec::new(),
            score,
            excluded: false,
        };
    }

    // Backward pass: weight 1.0 at the final token, decayed per position
    // toward the start.
    let mut weights = vec![0.0; num_tokens];
    let mut w = 1.0;
    for t in (0..num_tokens).rev() {
        weights[t] = w;
        w *= gamma;
    }

    let norm: f64 = weights.iter().sum();
    let values: Vec<f64> = weights.iter().map(|w| score * w / norm).collect();

    CreditArray {
        values,
        score,
        excluded: false,
    }
}

/// Suffix minimum over step scores, scanned from the end.
///
/// The comparison is strict, so ties keep the later step's score.
fn suffix_min(step_scores: &[f64]) -> Vec<f64> {
    let mut suffix = vec![0.0; step_scores.len()];
    let mut running = f64::INFINITY;
    for (i, &s) in step_scores.iter().enumerate().rev() {
        if s < running {
            running = s;
        }
        suffix[i] = running;
    }
    suffix
}

/// Suffix soft-min: -tau * log sum exp(-x_j / tau) over the suffix of steps.
///
/// The running log-sum-exp is kept in log space (max subtraction inside
/// `log_add_exp`), so large magnitudes and small temperatures never overflow
/// the exponentials.
fn suffix_softmin(step_scores: &[f64], tau: f64) -> Vec<f64> {
    let mut suffix = vec![0.0; step_scores.len()];
    let mut lse = f64::NEG_INFINITY;
    for (i, &s) in step_scores.iter().enumerate().rev() {
        lse = log_add_exp(-s / tau, lse);
        suffix[i] = -tau * lse;
    }
    suffix
}

/// log(exp(a) + exp(b)) with the standard max-subtraction stabilization.
fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// Expand one value per step into one value per token.
///
/// Step k covers tokens [boundary(k-1), boundary(k)); tokens past the last
/// boundary belong to the last step.
fn expand_steps(per_step: &[f64], boundaries: &[usize], num_tokens: usize) -> CreditArray {
    let mut values = vec![0.0; num_tokens];
    let mut start = 0usize;
    for (k, &end) in boundaries.iter().enumerate() {
        let end = end.min(num_tokens);
        for v in &mut values[start..end] {
            *v = per_step[k];
        }
        start = end;
    }
    if let Some(&last) = per_step.last() {
        for v in &mut values[start..] {
            *v = last;
        }
    }

    let score = values.last().copied().unwrap_or_default();
    CreditArray {
        values,
        score,
        excluded: false,
    }
}
