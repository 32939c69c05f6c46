//! Advantage estimation: blending credit arrays from multiple reward
//! sources, subtracting a leave-one-out group baseline, applying a per-token
//! KL penalty against the frozen reference policy, and optional whitening.
//!
//! The leave-one-out baseline is the variance-reduction mechanism replacing a
//! learned value function: for each rollout in a group of size n, the
//! baseline is the mean recovered credit of the other n - 1 members. Groups
//! of size 1 get baseline 0. Rollouts excluded by the credit engine are
//! omitted from all statistics but still emit a zero advantage array, so
//! they contribute no gradient signal without destabilizing the batch.

use std::collections::HashSet;

use tracing::debug;

use crate::config::{AdvantageConfig, KlPenalty};
use crate::rollout::{group_indices, CreditArray, Rollout};

/// Per-source credit arrays for one rollout, prior to blending.
#[derive(Debug, Clone, Default)]
pub struct CreditSet {
    pub verifier: Option<CreditArray>,
    pub prm: Option<CreditArray>,
    pub judge: Option<CreditArray>,
}

/// Advantages plus the aggregate statistics the step report carries.
#[derive(Debug, Clone)]
pub struct EstimateOutput {
    /// One advantage array per rollout, aligned with its generated tokens.
    pub advantages: Vec<Vec<f64>>,
    /// Which rollouts were excluded from baseline/normalization statistics.
    pub excluded: Vec<bool>,
    pub mean_credit: f64,
    pub mean_advantage: f64,
    pub advantage_std: f64,
    pub mean_kl: f64,
}

pub struct AdvantageEstimator {
    config: AdvantageConfig,
}

impl AdvantageEstimator {
    pub fn new(config: AdvantageConfig) -> Self {
        Self { config }
    }

    /// Blend the per-source credit arrays for one rollout into a single
    /// weighted-sum array.
    ///
    /// The verifier carries the verifiable-reward weight; PRM and judge carry
    /// the modeling-reward weight. A rollout is excluded as soon as any of
    /// its sources is invalid: a zeroed stand-in would silently drag the
    /// group baseline instead of being accounted for explicitly.
    pub fn blend(&self, credits: &CreditSet, num_tokens: usize) -> CreditArray {
        let parts: [(&Option<CreditArray>, f64); 3] = [
            (&credits.verifier, self.config.verifiable_weight),
            (&credits.prm, self.config.modeling_weight),
            (&credits.judge, self.config.modeling_weight),
        ];

        let mut any = false;
        let mut values = vec![0.0; num_tokens];
        let mut score = 0.0;

        for (credit, weight) in parts {
            let Some(credit) = credit else { continue };
            if credit.excluded {
                return CreditArray::excluded(num_tokens);
            }
            any = true;
            for (acc, v) in values.iter_mut().zip(&credit.values) {
                *acc += weight * v;
            }
            score += weight * credit.score;
        }

        if !any {
            return CreditArray::excluded(num_tokens);
        }
        CreditArray {
            values,
            score,
            excluded: false,
        }
    }

    /// Compute per-token advantages for a step's rollouts from their blended
    /// credit arrays.
    pub fn estimate(&self, rollouts: &[Rollout], blended: &[CreditArray]) -> EstimateOutput {
        debug_assert_eq!(rollouts.len(), blended.len());

        let excluded: Vec<bool> = blended.iter().map(|c| c.excluded).collect();
        let baselines = leave_one_out_baselines(rollouts, blended);

        let mut advantages: Vec<Vec<f64>> = Vec::with_capacity(rollouts.len());
        let mut kl_sum = 0.0;
        let mut kl_tokens = 0usize;

        for (i, (rollout, credit)) in rollouts.iter().zip(blended).enumerate() {
            if credit.excluded {
                advantages.push(vec![0.0; rollout.response_len()]);
                continue;
            }

            let mut adv: Vec<f64> = credit.values.iter().map(|v| v - baselines[i]).collect();

            // Per-token KL penalty against the frozen reference policy.
            if self.config.kl_coeff > 0.0 {
                if let (Some(policy), Some(reference)) =
                    (&rollout.policy_log_probs, &rollout.ref_log_probs)
                {
                    if policy.len() == adv.len() && reference.len() == adv.len() {
                        for ((a, &lp), &ref_lp) in adv.iter_mut().zip(policy).zip(reference) {
                            let kl = kl_estimate(self.config.kl_penalty, lp, ref_lp);
                            *a -= self.config.kl_coeff * kl;
                            kl_sum += kl;
                            kl_tokens += 1;
                        }
                    } else {
                        debug!(
                            rollout_id = %rollout.id,
                            "log-prob arrays misaligned with response tokens, skipping KL penalty"
                        );
                    }
                }
            }

            // Scale down the signal of repetitive responses.
            if self.config.repeat_penalty_enabled {
                let ratio = repetition_ratio(&rollout.response_tokens, self.config.repeat_ngram);
                if ratio > self.config.repeat_threshold {
                    debug!(rollout_id = %rollout.id, ratio, "applying repeat penalty");
                    for a in &mut adv {
                        *a *= self.config.repeat_scale;
                    }
                }
            }

            advantages.push(adv);
        }

        if self.config.normalize_advantages {
            normalize(&mut advantages, &excluded);
        }

        let (mean_advantage, advantage_std) = advantage_stats(&advantages, &excluded);
        let valid_scores: Vec<f64> = blended
            .iter()
            .filter(|c| !c.excluded)
            .map(|c| c.score)
            .collect();
        let mean_credit = if valid_scores.is_empty() {
            0.0
        } else {
            valid_scores.iter().sum::<f64>() / valid_scores.len() as f64
        };
        let mean_kl = if kl_tokens == 0 {
            0.0
        } else {
            kl_sum / kl_tokens as f64
        };

        EstimateOutput {
            advantages,
            excluded,
            mean_credit,
            mean_advantage,
            advantage_std,
            mean_kl,
        }
    }
}

/// Leave-one-out baseline per rollout: the mean recovered credit of the other
/// valid members of its group.
///
/// Excluded members contribute nothing to any baseline; a rollout with no
/// valid siblings gets baseline 0 rather than its own score, so singleton
/// groups still carry signal.
fn leave_one_out_baselines(rollouts: &[Rollout], blended: &[CreditArray]) -> Vec<f64> {
    let mut baselines = vec![0.0; rollouts.len()];

    for indices in group_indices(rollouts).values() {
        let valid: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| !blended[i].excluded)
            .collect();
        if valid.len() < 2 {
            continue;
        }

        let sum: f64 = valid.iter().map(|&i| blended[i].score).sum();
        let n = valid.len() as f64;
        for &i in &valid {
            baselines[i] = (sum - blended[i].score) / (n - 1.0);
        }
    }

    baselines
}

// ---------------------------------------------------------------------------
// KL estimators
// ---------------------------------------------------------------------------

// Clamps keeping the k3 estimator's exponential in range on noisy log probs.
const KL_CLAMP_INPUT: f64 = 20.0;
const KL_CLAMP_OUTPUT: f64 = 10.0;

/// Token-wise KL divergence estimate between the current policy and the
/// reference, from the two log-probabilities at the sampled token.
pub fn kl_estimate(penalty: KlPenalty, policy_lp: f64, ref_lp: f64) -> f64 {
    let delta = policy_lp - ref_lp;
    match penalty {
        KlPenalty::Kl => delta,
        KlPenalty::Abs => delta.abs(),
        KlPenalty::Mse => 0.5 * delta * delta,
        KlPenalty::LowVarKl => {
            // k3 estimator: exp(d) - d - 1 with d = ref - policy.
            let d = (-delta).clamp(-KL_CLAMP_INPUT, KL_CLAMP_INPUT);
            (d.exp() - d - 1.0).min(KL_CLAMP_OUTPUT)
        }
    }
}

// ---------------------------------------------------------------------------
// Repeat penalty
// ---------------------------------------------------------------------------

/// Fraction of `n`-grams in `tokens` that repeat an earlier n-gram.
pub fn repetition_ratio(tokens: &[u32], n: usize) -> f64 {
    if n == 0 || tokens.len() < n {
        return 0.0;
    }
    let total = tokens.len() - n + 1;
    let unique: HashSet<&[u32]> = tokens.windows(n).collect();
    1.0 - unique.len() as f64 / total as f64
}

// ---------------------------------------------------------------------------
// Normalization and statistics
// ---------------------------------------------------------------------------

/// Whiten advantages to zero mean and unit variance across all tokens of
/// non-excluded rollouts. Excluded rollouts keep their zero arrays.
fn normalize(advantages: &mut [Vec<f64>], excluded: &[bool]) {
    let (mean, std) = advantage_stats(advantages, excluded);
    if std < 1e-8 {
        return;
    }
    for (adv, &skip) in advantages.iter_mut().zip(excluded) {
        if skip {
            continue;
        }
        for a in adv.iter_mut() {
            *a = (*a - mean) / std;
        }
    }
}

fn advantage_stats(advantages: &[Vec<f64>], excluded: &[bool]) -> (f64, f64) {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (adv, &skip) in advantages.iter().zip(excluded) {
        if skip {
            continue;
        }
        sum += adv.iter().sum::<f64>();
        count += adv.len();
    }
    if count == 0 {
        return (0.0, 0.0);
    }
    let mean = sum / count as f64;

    let mut var = 0.0;
    for (adv, &skip) in advantages.iter().zip(excluded) {
        if skip {
            continue;
        }
        var += adv.iter().map(|a| (a - mean).powi(2)).sum::<f64>();
    }
    (mean, (var / count as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CreditConfig, CreditStrategy};
    use crate::rollout::{RewardScore, RewardSource};
    use crate::training::credit::assign_credit;

    fn rollout(id: &str, group: &str, num_tokens: usize, boundaries: Vec<usize>) -> Rollout {
        Rollout {
            id: id.into(),
            prompt: String::new(),
            response: String::new(),
            prompt_tokens: Vec::new(),
            response_tokens: (0..num_tokens as u32).collect(),
            step_boundaries: boundaries,
            group_id: group.into(),
            finished: true,
            policy_log_probs: None,
            ref_log_probs: None,
        }
    }

    fn credit(score: f64, num_tokens: usize) -> CreditArray {
        CreditArray {
            values: vec![score; num_tokens],
            score,
            excluded: false,
        }
    }

    fn no_kl() -> AdvantageConfig {
        AdvantageConfig {
            kl_coeff: 0.0,
            ..AdvantageConfig::default()
        }
    }

    // ------------------------------------------------------------------
    // blending
    // ------------------------------------------------------------------

    #[test]
    fn test_blend_weighted_sum() {
        let est = AdvantageEstimator::new(AdvantageConfig {
            verifiable_weight: 2.0,
            modeling_weight: 0.5,
            ..no_kl()
        });

        let set = CreditSet {
            verifier: Some(credit(1.0, 3)),
            prm: Some(credit(0.4, 3)),
            judge: None,
        };
        let blended = est.blend(&set, 3);
        assert!(!blended.excluded);
        // 2.0 * 1.0 + 0.5 * 0.4 = 2.2
        for v in &blended.values {
            assert!((v - 2.2).abs() < 1e-12);
        }
        assert!((blended.score - 2.2).abs() < 1e-12);
    }

    #[test]
    fn test_blend_any_invalid_source_excludes_rollout() {
        let est = AdvantageEstimator::new(no_kl());
        let set = CreditSet {
            verifier: Some(credit(1.0, 3)),
            prm: None,
            judge: Some(CreditArray::excluded(3)),
        };
        let blended = est.blend(&set, 3);
        assert!(blended.excluded);
        assert_eq!(blended.values, vec![0.0; 3]);
    }

    #[test]
    fn test_blend_no_sources_excludes_rollout() {
        let est = AdvantageEstimator::new(no_kl());
        let blended = est.blend(&CreditSet::default(), 2);
        assert!(blended.excluded);
    }

    // ------------------------------------------------------------------
    // leave-one-out baseline
    // ------------------------------------------------------------------

    #[test]
    fn test_group_zero_mean_after_baseline() {
        let est = AdvantageEstimator::new(no_kl());
        let rollouts: Vec<Rollout> = (0..4)
            .map(|i| rollout(&format!("r{i}"), "g", 1, vec![]))
            .collect();
        let blended = vec![
            credit(0.8, 1),
            credit(0.2, 1),
            credit(0.9, 1),
            credit(0.5, 1),
        ];

        let out = est.estimate(&rollouts, &blended);
        // With single-token rollouts the advantage equals score - baseline;
        // leave-one-out residuals sum to zero exactly.
        let sum: f64 = out.advantages.iter().map(|a| a[0]).sum();
        assert!(sum.abs() < 1e-12);
    }

    #[test]
    fn test_singleton_group_baseline_is_zero() {
        let est = AdvantageEstimator::new(no_kl());
        let rollouts = vec![rollout("r0", "g", 2, vec![])];
        let blended = vec![credit(0.7, 2)];

        let out = est.estimate(&rollouts, &blended);
        // Baseline 0: the advantage is the credit itself.
        assert!((out.advantages[0][0] - 0.7).abs() < 1e-12);
        assert!((out.advantages[0][1] - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_strict_min_group_scenario() {
        // 4 rollouts from one group scored per step with boundaries [2, 4].
        // Strict-min recovers final-token credits [0.8, 0.2, 0.9, 0.5]
        // (group mean 0.6); rollout 0's final-token advantage is
        // 0.8 - mean(0.2, 0.9, 0.5) ~ 0.267.
        let credit_cfg = CreditConfig {
            strategy: CreditStrategy::StrictMin,
            gamma: 1.0,
        };
        let step_scores = [
            vec![0.9, 0.8],
            vec![0.9, 0.2],
            vec![0.1, 0.9],
            vec![0.5, 0.5],
        ];

        let rollouts: Vec<Rollout> = (0..4)
            .map(|i| rollout(&format!("r{i}"), "g", 4, vec![2, 4]))
            .collect();
        let blended: Vec<CreditArray> = rollouts
            .iter()
            .zip(&step_scores)
            .map(|(r, s)| {
                assign_credit(
                    &credit_cfg,
                    r,
                    &RewardScore::steps(RewardSource::Prm, s.clone()),
                )
                .unwrap()
            })
            .collect();

        let scores: Vec<f64> = blended.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.8, 0.2, 0.9, 0.5]);
        let group_mean: f64 = scores.iter().sum::<f64>() / 4.0;
        assert!((group_mean - 0.6).abs() < 1e-12);

        let est = AdvantageEstimator::new(no_kl());
        let out = est.estimate(&rollouts, &blended);
        let expected = 0.8 - (0.2 + 0.9 + 0.5) / 3.0;
        assert!((out.advantages[0][3] - expected).abs() < 1e-12);
        assert!((expected - 0.267).abs() < 1e-3);
    }

    #[test]
    fn test_excluded_rollout_omitted_from_baseline_but_zeroed() {
        let est = AdvantageEstimator::new(no_kl());
        let rollouts: Vec<Rollout> = (0..4)
            .map(|i| rollout(&format!("r{i}"), "g", 1, vec![]))
            .collect();
        let blended = vec![
            credit(0.8, 1),
            CreditArray::excluded(1),
            credit(0.9, 1),
            credit(0.5, 1),
        ];

        let out = est.estimate(&rollouts, &blended);
        // Excluded rollout: advantage 0, still present in the output.
        assert_eq!(out.advantages[1], vec![0.0]);
        assert!(out.excluded[1]);
        // Baseline for rollout 0 covers the remaining valid members only.
        let expected = 0.8 - (0.9 + 0.5) / 2.0;
        assert!((out.advantages[0][0] - expected).abs() < 1e-12);
    }

    // ------------------------------------------------------------------
    // KL penalty
    // ------------------------------------------------------------------

    #[test]
    fn test_kl_estimators() {
        assert!((kl_estimate(KlPenalty::Kl, -1.0, -1.5) - 0.5).abs() < 1e-12);
        assert!((kl_estimate(KlPenalty::Abs, -2.0, -1.5) - 0.5).abs() < 1e-12);
        assert!((kl_estimate(KlPenalty::Mse, -1.0, -2.0) - 0.5).abs() < 1e-12);

        // Low-variance k3 is zero when the policies agree and non-negative
        // otherwise.
        assert!(kl_estimate(KlPenalty::LowVarKl, -1.0, -1.0).abs() < 1e-12);
        assert!(kl_estimate(KlPenalty::LowVarKl, -1.0, -3.0) > 0.0);
        assert!(kl_estimate(KlPenalty::LowVarKl, -3.0, -1.0) > 0.0);
    }

    #[test]
    fn test_kl_low_var_clamped() {
        // Extreme drift must not overflow or dominate the advantage.
        let kl = kl_estimate(KlPenalty::LowVarKl, -200.0, -1.0);
        assert!(kl.is_finite());
        assert!(kl <= KL_CLAMP_OUTPUT);
    }

    #[test]
    fn test_kl_penalty_lowers_advantage() {
        let est = AdvantageEstimator::new(AdvantageConfig {
            kl_coeff: 0.1,
            kl_penalty: KlPenalty::LowVarKl,
            ..AdvantageConfig::default()
        });

        let mut r = rollout("r0", "g", 2, vec![]);
        r.policy_log_probs = Some(vec![-1.0, -1.0]);
        r.ref_log_probs = Some(vec![-2.0, -2.0]);

        let with_kl = est.estimate(std::slice::from_ref(&r), &[credit(1.0, 2)]);
        let without_kl = AdvantageEstimator::new(no_kl())
            .estimate(std::slice::from_ref(&r), &[credit(1.0, 2)]);

        assert!(with_kl.advantages[0][0] < without_kl.advantages[0][0]);
        assert!(with_kl.mean_kl > 0.0);
    }

    #[test]
    fn test_missing_log_probs_skips_kl() {
        let est = AdvantageEstimator::new(AdvantageConfig {
            kl_coeff: 0.1,
            ..AdvantageConfig::default()
        });
        let r = rollout("r0", "g", 2, vec![]);

        let out = est.estimate(std::slice::from_ref(&r), &[credit(1.0, 2)]);
        assert!((out.advantages[0][0] - 1.0).abs() < 1e-12);
        assert_eq!(out.mean_kl, 0.0);
    }

    // ------------------------------------------------------------------
    // repeat penalty
    // ------------------------------------------------------------------

    #[test]
    fn test_repetition_ratio() {
        // All distinct bigrams.
        assert_eq!(repetition_ratio(&[1, 2, 3, 4], 2), 0.0);
        // "1 2 1 2 1 2": 5 bigrams, 2 unique.
        let ratio = repetition_ratio(&[1, 2, 1, 2, 1, 2], 2);
        assert!((ratio - 0.6).abs() < 1e-12);
        // Too short to contain any n-gram.
        assert_eq!(repetition_ratio(&[1], 2), 0.0);
    }

    #[test]
    fn test_repeat_penalty_scales_advantage() {
        let est = AdvantageEstimator::new(AdvantageConfig {
            repeat_penalty_enabled: true,
            repeat_ngram: 2,
            repeat_threshold: 0.3,
            repeat_scale: 0.5,
            ..no_kl()
        });

        let mut r = rollout("r0", "g", 6, vec![]);
        r.response_tokens = vec![1, 2, 1, 2, 1, 2]; // ratio 0.6, over threshold

        let out = est.estimate(std::slice::from_ref(&r), &[credit(1.0, 6)]);
        assert!((out.advantages[0][0] - 0.5).abs() < 1e-12);
    }

    // ------------------------------------------------------------------
    // normalization
    // ------------------------------------------------------------------

    #[test]
    fn test_normalization_whitens_batch() {
        let est = AdvantageEstimator::new(AdvantageConfig {
            normalize_advantages: true,
            ..no_kl()
        });

        let rollouts: Vec<Rollout> = (0..3)
            .map(|i| rollout(&format!("r{i}"), &format!("g{i}"), 2, vec![]))
            .collect();
        let blended = vec![credit(1.0, 2), credit(2.0, 2), credit(4.0, 2)];

        let out = est.estimate(&rollouts, &blended);
        let all: Vec<f64> = out.advantages.iter().flatten().copied().collect();
        let mean: f64 = all.iter().sum::<f64>() / all.len() as f64;
        let var: f64 = all.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / all.len() as f64;
        assert!(mean.abs() < 1e-9);
        assert!((var.sqrt() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalization_keeps_excluded_at_zero() {
        let est = AdvantageEstimator::new(AdvantageConfig {
            normalize_advantages: true,
            ..no_kl()
        });

        let rollouts: Vec<Rollout> = (0..3)
            .map(|i| rollout(&format!("r{i}"), "g", 1, vec![]))
            .collect();
        let blended = vec![credit(1.0, 1), CreditArray::excluded(1), credit(3.0, 1)];

        let out = est.estimate(&rollouts, &blended);
        assert_eq!(out.advantages[1], vec![0.0]);
    }
}
