use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Complete configuration for the reward aggregation pipeline.
///
/// Constructed once (from a JSON file or [`Default`]) and passed into each
/// component's constructor; there is no ambient global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub sources: RewardSourceConfig,
    pub judge: JudgeConfig,
    pub credit: CreditConfig,
    pub advantage: AdvantageConfig,
    pub scheduler: SchedulerConfig,
    /// Emit a checkpoint signal every N training steps (0 = never).
    pub checkpoint_interval: usize,
}

/// Enable flags for the three reward producers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardSourceConfig {
    /// Rule-based verifier over (prompt, response) text (default: true).
    pub verifier_enabled: bool,
    /// Process reward model scoring each reasoning step (default: false).
    pub prm_enabled: bool,
    /// LLM-as-judge over HTTP (default: false).
    pub judge_enabled: bool,
}

/// LLM-as-judge client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Base URL for the judge API (e.g. "https://api.openai.com/v1").
    pub api_base: String,
    /// API key for bearer authentication.
    pub api_key: String,
    /// Judge model identifier.
    pub model_id: String,
    /// Maximum tokens the judge may generate per verdict (default: 512).
    pub max_output_tokens: usize,
    /// Sampling temperature for the judge (default: 0.0).
    pub temperature: f64,
    /// Per-request timeout in seconds (default: 30).
    pub timeout_secs: u64,
    /// Total attempt budget per judge call; after this many failed attempts
    /// the score is marked invalid (default: 3).
    pub max_retries: usize,
    /// Fixed delay between retries, in seconds (default: 2).
    pub retry_delay_secs: u64,
    /// Optional prompt template with `{prompt}` / `{response}` placeholders;
    /// a built-in rubric is used when absent.
    pub prompt_template: Option<String>,
    /// Whether the judge backend may run custom remote tokenization code.
    pub trust_remote_code: bool,
    /// Maximum concurrent in-flight judge requests (default: 4).
    pub max_concurrency: usize,
}

/// Credit assignment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditConfig {
    /// Strategy for spreading a reward over the generated tokens.
    ///
    /// Serialized as the string `"gamma-decay"`, the string
    /// `"strict-min-form"`, or a bare positive number interpreted as the
    /// soft-min temperature.
    pub strategy: CreditStrategy,
    /// Discount factor for the gamma-decay strategy, in (0, 1] (default: 1.0).
    pub gamma: f64,
}

/// Advantage estimation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvantageConfig {
    /// Weight for the verifiable (verifier) reward component (default: 1.0).
    pub verifiable_weight: f64,
    /// Weight for the modeling reward components, PRM and judge (default: 1.0).
    pub modeling_weight: f64,
    /// Which per-token KL estimator to use (default: low-var-kl).
    pub kl_penalty: KlPenalty,
    /// KL penalty coefficient beta (default: 0.001).
    pub kl_coeff: f64,
    /// Whiten the advantage distribution across the batch (default: false).
    pub normalize_advantages: bool,
    /// Scale down advantages of highly repetitive responses (default: false).
    pub repeat_penalty_enabled: bool,
    /// N-gram size for the repetition check (default: 4).
    pub repeat_ngram: usize,
    /// Repetition ratio above which the penalty triggers (default: 0.3).
    pub repeat_threshold: f64,
    /// Multiplicative scale applied to penalized advantages (default: 0.5).
    pub repeat_scale: f64,
}

/// Batch scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum total token count per micro-batch on one worker.
    pub token_budget: usize,
    /// Rollouts sampled per prompt (group size G for the baseline). The
    /// scheduler warns when an observed group's size disagrees.
    pub group_size: usize,
}

// ---------------------------------------------------------------------------
// Credit strategy
// ---------------------------------------------------------------------------

/// How step/sequence-level reward is distributed over generated tokens.
///
/// Selection happens once at configuration load; the engine dispatches on
/// this tag, not on per-call string matching.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CreditStrategy {
    /// Treat the sequence score as a terminal reward and spread it backward
    /// with a per-position discount.
    GammaDecay,
    /// Each token's credit is the minimum step score over the suffix of steps
    /// from its position to the end of the sequence.
    StrictMin,
    /// Differentiable soft-min over the same suffix, with temperature tau.
    /// Converges to [`CreditStrategy::StrictMin`] as tau approaches 0.
    SoftMin(f64),
}

impl Serialize for CreditStrategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            CreditStrategy::GammaDecay => serializer.serialize_str("gamma-decay"),
            CreditStrategy::StrictMin => serializer.serialize_str("strict-min-form"),
            CreditStrategy::SoftMin(tau) => serializer.serialize_f64(*tau),
        }
    }
}

impl<'de> Deserialize<'de> for CreditStrategy {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct StrategyVisitor;

        impl<'de> Visitor<'de> for StrategyVisitor {
            type Value = CreditStrategy;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(
                    "\"gamma-decay\", \"strict-min-form\", or a positive soft-min temperature",
                )
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<CreditStrategy, E> {
                match v {
                    "gamma-decay" => Ok(CreditStrategy::GammaDecay),
                    "strict-min-form" => Ok(CreditStrategy::StrictMin),
                    other => Err(E::custom(format!(
                        "unknown credit assignment strategy: {other:?}"
                    ))),
                }
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<CreditStrategy, E> {
                Ok(CreditStrategy::SoftMin(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<CreditStrategy, E> {
                Ok(CreditStrategy::SoftMin(v as f64))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<CreditStrategy, E> {
                Ok(CreditStrategy::SoftMin(v as f64))
            }
        }

        deserializer.deserialize_any(StrategyVisitor)
    }
}

// ---------------------------------------------------------------------------
// KL penalty
// ---------------------------------------------------------------------------

/// Per-token KL divergence estimator between the current and the frozen
/// reference policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KlPenalty {
    /// Plain log-probability difference: log pi(t) - log pi_ref(t).
    Kl,
    /// Absolute log-probability difference.
    Abs,
    /// Half squared log-probability difference.
    Mse,
    /// Low-variance k3 estimator: exp(d) - d - 1 with d = ref - policy.
    /// Non-negative by construction.
    LowVarKl,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sources: RewardSourceConfig {
                verifier_enabled: true,
                prm_enabled: false,
                judge_enabled: false,
            },
            judge: JudgeConfig::default(),
            credit: CreditConfig {
                strategy: CreditStrategy::GammaDecay,
                gamma: 1.0,
            },
            advantage: AdvantageConfig::default(),
            scheduler: SchedulerConfig::default(),
            checkpoint_interval: 0,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            token_budget: 16384,
            group_size: 8,
        }
    }
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".into(),
            api_key: String::new(),
            model_id: "gpt-4o-mini".into(),
            max_output_tokens: 512,
            temperature: 0.0,
            timeout_secs: 30,
            max_retries: 3,
            retry_delay_secs: 2,
            prompt_template: None,
            trust_remote_code: false,
            max_concurrency: 4,
        }
    }
}

impl Default for AdvantageConfig {
    fn default() -> Self {
        Self {
            verifiable_weight: 1.0,
            modeling_weight: 1.0,
            kl_penalty: KlPenalty::LowVarKl,
            kl_coeff: 0.001,
            normalize_advantages: false,
            repeat_penalty_enabled: false,
            repeat_ngram: 4,
            repeat_threshold: 0.3,
            repeat_scale: 0.5,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl PipelineConfig {
    /// Check the configuration before a training step runs.
    ///
    /// No partial step may run on an invalid config, so the pipeline calls
    /// this at construction and fails immediately.
    pub fn validate(&self) -> Result<()> {
        if let CreditStrategy::SoftMin(tau) = self.credit.strategy {
            if !(tau > 0.0) || !tau.is_finite() {
                return Err(PipelineError::Configuration(format!(
                    "soft-min temperature must be a positive finite number, got {tau}"
                )));
            }
        }
        if !(self.credit.gamma > 0.0 && self.credit.gamma <= 1.0) {
            return Err(PipelineError::Configuration(format!(
                "gamma must be in (0, 1], got {}",
                self.credit.gamma
            )));
        }

        let adv = &self.advantage;
        if adv.verifiable_weight < 0.0 || adv.modeling_weight < 0.0 {
            return Err(PipelineError::Configuration(
                "reward blend weights must be non-negative".into(),
            ));
        }
        if adv.verifiable_weight == 0.0 && adv.modeling_weight == 0.0 {
            return Err(PipelineError::Configuration(
                "at least one reward blend weight must be positive".into(),
            ));
        }
        if adv.kl_coeff < 0.0 {
            return Err(PipelineError::Configuration(
                "kl_coeff must be non-negative".into(),
            ));
        }
        if adv.repeat_penalty_enabled {
            if adv.repeat_ngram == 0 {
                return Err(PipelineError::Configuration(
                    "repeat_ngram must be at least 1".into(),
                ));
            }
            if !(0.0..=1.0).contains(&adv.repeat_threshold) {
                return Err(PipelineError::Configuration(
                    "repeat_threshold must be in [0, 1]".into(),
                ));
            }
            if !(0.0..=1.0).contains(&adv.repeat_scale) {
                return Err(PipelineError::Configuration(
                    "repeat_scale must be in [0, 1]".into(),
                ));
            }
        }

        if self.scheduler.token_budget == 0 {
            return Err(PipelineError::Configuration(
                "token_budget must be positive".into(),
            ));
        }
        if self.scheduler.group_size == 0 {
            return Err(PipelineError::Configuration(
                "group_size must be positive".into(),
            ));
        }

        if self.sources.judge_enabled {
            if self.judge.api_base.is_empty() {
                return Err(PipelineError::Configuration(
                    "judge enabled but api_base is empty".into(),
                ));
            }
            if self.judge.max_concurrency == 0 {
                return Err(PipelineError::Configuration(
                    "judge max_concurrency must be positive".into(),
                ));
            }
            if self.judge.max_retries == 0 {
                return Err(PipelineError::Configuration(
                    "judge max_retries must allow at least one attempt".into(),
                ));
            }
        }

        if !self.sources.verifier_enabled
            && !self.sources.prm_enabled
            && !self.sources.judge_enabled
        {
            return Err(PipelineError::Configuration(
                "at least one reward source must be enabled".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_strategy_from_string() {
        let s: CreditStrategy = serde_json::from_str("\"gamma-decay\"").unwrap();
        assert_eq!(s, CreditStrategy::GammaDecay);

        let s: CreditStrategy = serde_json::from_str("\"strict-min-form\"").unwrap();
        assert_eq!(s, CreditStrategy::StrictMin);
    }

    #[test]
    fn test_strategy_from_number_is_softmin_temperature() {
        let s: CreditStrategy = serde_json::from_str("0.5").unwrap();
        assert_eq!(s, CreditStrategy::SoftMin(0.5));

        // Integers in the config file are temperatures too.
        let s: CreditStrategy = serde_json::from_str("2").unwrap();
        assert_eq!(s, CreditStrategy::SoftMin(2.0));
    }

    #[test]
    fn test_strategy_unknown_string_rejected() {
        let r: std::result::Result<CreditStrategy, _> = serde_json::from_str("\"mean-form\"");
        assert!(r.is_err());
    }

    #[test]
    fn test_strategy_serialization_roundtrip() {
        for s in [
            CreditStrategy::GammaDecay,
            CreditStrategy::StrictMin,
            CreditStrategy::SoftMin(0.25),
        ] {
            let json = serde_json::to_string(&s).unwrap();
            let parsed: CreditStrategy = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn test_invalid_softmin_temperature() {
        let mut config = PipelineConfig::default();
        config.credit.strategy = CreditStrategy::SoftMin(0.0);
        assert!(config.validate().is_err());

        config.credit.strategy = CreditStrategy::SoftMin(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_conflicting_weights_rejected() {
        let mut config = PipelineConfig::default();
        config.advantage.verifiable_weight = 0.0;
        config.advantage.modeling_weight = 0.0;
        assert!(config.validate().is_err());

        config.advantage.verifiable_weight = -1.0;
        config.advantage.modeling_weight = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_token_budget_rejected() {
        let mut config = PipelineConfig::default();
        config.scheduler.token_budget = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_judge_zero_attempt_budget_rejected() {
        let mut config = PipelineConfig::default();
        config.sources.judge_enabled = true;
        config.judge.max_retries = 0;
        assert!(config.validate().is_err());

        config.judge.max_retries = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_no_sources_rejected() {
        let mut config = PipelineConfig::default();
        config.sources.verifier_enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = PipelineConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.scheduler.token_budget, config.scheduler.token_budget);
    }
}
