//! LLM-as-judge adapter.
//!
//! Sends (prompt, response) pairs to an OpenAI-compatible chat completions
//! endpoint and parses a scalar score out of the judge's verdict. Transport
//! failures and timeouts are retried a bounded number of times with a fixed
//! delay, then downgraded to an invalid score marker: a single unreachable
//! judge call must never abort a training step.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::JudgeConfig;
use crate::rollout::{RewardScore, RewardSource, Rollout};

use super::RewardAdapter;

const DEFAULT_TEMPLATE: &str = "You are grading a model response.\n\
Task:\n{prompt}\n\nResponse:\n{response}\n\n\
Rate the response's correctness and reasoning quality on a scale from 0.0 \
to 1.0. Reply with the numeric score first, then a one-sentence justification.";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
    #[serde(default)]
    completion_tokens: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// HTTP client for judge scoring.
///
/// The underlying connection pool lives for the reward-computation phase of a
/// batch; the scoring phase drops the adapter afterward.
pub struct JudgeAdapter {
    config: JudgeConfig,
    http: reqwest::Client,
}

impl JudgeAdapter {
    /// Build the adapter, installing the configured request timeout on the
    /// HTTP client.
    pub fn new(config: JudgeConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("failed to build reqwest client");
        Self { config, http }
    }

    /// Maximum concurrent in-flight judge calls, for the scoring fan-out.
    pub fn max_concurrency(&self) -> usize {
        self.config.max_concurrency.max(1)
    }

    async fn request_verdict(&self, rollout: &Rollout) -> anyhow::Result<(String, usize)> {
        let url = format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        );
        let template = self
            .config
            .prompt_template
            .as_deref()
            .unwrap_or(DEFAULT_TEMPLATE);
        let content = render_template(template, &rollout.prompt, &rollout.response);

        let body = serde_json::json!({
            "model": self.config.model_id,
            "messages": [ChatMessage { role: "user".into(), content }],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_output_tokens,
            "trust_remote_code": self.config.trust_remote_code,
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("judge API returned {status}: {text}");
        }

        let parsed: ChatResponse = resp.json().await?;
        let verdict = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();
        let completion_tokens = parsed.usage.map(|u| u.completion_tokens).unwrap_or(0);
        Ok((verdict, completion_tokens))
    }
}

impl RewardAdapter for JudgeAdapter {
    fn source(&self) -> RewardSource {
        RewardSource::Judge
    }

    /// Score one rollout, retrying on transport failure.
    ///
    /// `max_retries` is the total attempt budget; once it is exhausted the
    /// adapter returns an invalid marker, cancelling only this rollout's
    /// judge score.
    async fn score(&self, rollout: &Rollout) -> RewardScore {
        let attempts = self.config.max_retries;
        for attempt in 0..attempts {
            match self.request_verdict(rollout).await {
                Ok((verdict, completion_tokens)) => {
                    let Some(raw) = parse_score(&verdict) else {
                        warn!(
                            rollout_id = %rollout.id,
                            verdict = %verdict,
                            "judge verdict contained no parseable score"
                        );
                        return RewardScore::invalid(RewardSource::Judge);
                    };
                    let score = length_penalty(
                        raw.clamp(0.0, 1.0),
                        completion_tokens,
                        self.config.max_output_tokens,
                    );
                    debug!(rollout_id = %rollout.id, score, completion_tokens, "judge verdict scored");
                    return RewardScore::sequence(RewardSource::Judge, score);
                }
                Err(e) => {
                    warn!(
                        rollout_id = %rollout.id,
                        attempt = attempt + 1,
                        attempts,
                        error = %e,
                        "judge call failed"
                    );
                    if attempt + 1 < attempts {
                        tokio::time::sleep(Duration::from_secs(self.config.retry_delay_secs))
                            .await;
                    }
                }
            }
        }
        RewardScore::invalid(RewardSource::Judge)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fill the `{prompt}` / `{response}` placeholders of a judge template.
fn render_template(template: &str, prompt: &str, response: &str) -> String {
    template
        .replace("{prompt}", prompt)
        .replace("{response}", response)
}

/// Extract the first numeric token from the judge's verdict text.
fn parse_score(verdict: &str) -> Option<f64> {
    verdict
        .split(|c: char| c.is_whitespace() || c == ':' || c == ',' || c == '/')
        .map(|tok| tok.trim_matches(|c: char| !c.is_ascii_digit() && c != '.' && c != '-'))
        .filter(|tok| !tok.is_empty())
        .find_map(|tok| tok.parse::<f64>().ok())
}

/// Discount the judge's score once its own output exceeds the allowed budget.
///
/// Monotonically decreasing in `completion_tokens` past the budget, which
/// removes the incentive to reward-hack via verbose verdicts.
fn length_penalty(score: f64, completion_tokens: usize, budget: usize) -> f64 {
    if budget == 0 || completion_tokens <= budget {
        return score;
    }
    score * budget as f64 / completion_tokens as f64
}
