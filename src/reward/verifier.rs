//! Rule-based verifier adapter.
//!
//! The verifier is a pure function over (prompt, generated text) returning a
//! correctness score in a fixed range, e.g. {0, 1} for exact-answer tasks or
//! a continuous value for partial credit.

use crate::rollout::{RewardScore, RewardSource, Rollout};

use super::RewardAdapter;

/// A pure correctness check over prompt and response text.
pub trait Verifier: Send + Sync {
    fn verify(&self, prompt: &str, response: &str) -> f64;
}

/// Wraps a plain closure as a [`Verifier`], the common case in tests and in
/// task-specific harnesses.
pub struct FnVerifier<F>(pub F);

impl<F> Verifier for FnVerifier<F>
where
    F: Fn(&str, &str) -> f64 + Send + Sync,
{
    fn verify(&self, prompt: &str, response: &str) -> f64 {
        (self.0)(prompt, response)
    }
}

/// Adapter presenting a [`Verifier`] as a sequence-scoped reward source.
pub struct VerifierAdapter {
    verifier: Box<dyn Verifier>,
}

impl VerifierAdapter {
    pub fn new(verifier: Box<dyn Verifier>) -> Self {
        Self { verifier }
    }
}

impl RewardAdapter for VerifierAdapter {
    fn source(&self) -> RewardSource {
        RewardSource::Verifier
    }

    async fn score(&self, rollout: &Rollout) -> RewardScore {
        let value = self.verifier.verify(&rollout.prompt, &rollout.response);
        RewardScore::sequence(RewardSource::Verifier, value)
    }
}
