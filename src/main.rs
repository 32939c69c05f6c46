//! Shoal: reward aggregation and credit assignment for RL post-training.
//!
//! Provides subcommands for working with recorded rollouts offline:
//!
//! - `step`         -- Run one full reward-pipeline step over recorded rollouts
//! - `pack`         -- Dry-run the batch scheduler and print the packing plan
//! - `check-config` -- Validate a configuration file

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use shoal::config::PipelineConfig;
use shoal::reward::{FnStepScorer, FnVerifier, StepScorer, Verifier};
use shoal::rollout::Rollout;
use shoal::training::{BatchScheduler, RewardPipeline};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Shoal: reward aggregation and credit assignment for RL post-training.
#[derive(Parser)]
#[command(name = "shoal", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one training step over recorded rollouts and save the batches.
    Step {
        /// Path to a JSON file of recorded rollouts.
        #[arg(long, default_value = "data/rollouts.json")]
        rollouts: PathBuf,

        /// Path to save the packed batches and step report.
        #[arg(long, default_value = "data/batches.json")]
        output: PathBuf,
    },

    /// Dry-run the batch scheduler and print the packing plan.
    Pack {
        /// Path to a JSON file of recorded rollouts.
        #[arg(long, default_value = "data/rollouts.json")]
        rollouts: PathBuf,

        /// Override the configured token budget.
        #[arg(long)]
        budget: Option<usize>,
    },

    /// Validate a configuration file and exit.
    CheckConfig,
}

// ---------------------------------------------------------------------------
// Recorded rollouts
// ---------------------------------------------------------------------------

/// A rollout as recorded by the sampling job, with optional precomputed
/// scores so verifier and PRM signals can be replayed offline.
#[derive(Debug, Deserialize)]
struct RolloutRecord {
    #[serde(default)]
    id: String,
    prompt: String,
    response: String,
    #[serde(default)]
    prompt_tokens: Vec<u32>,
    response_tokens: Vec<u32>,
    #[serde(default)]
    step_boundaries: Vec<usize>,
    group_id: String,
    #[serde(default = "default_finished")]
    finished: bool,
    #[serde(default)]
    policy_log_probs: Option<Vec<f64>>,
    #[serde(default)]
    ref_log_probs: Option<Vec<f64>>,
    /// Precomputed verifier score, replayed through the verifier adapter.
    #[serde(default)]
    verifier_score: Option<f64>,
    /// Precomputed per-step scores, replayed through the PRM adapter.
    #[serde(default)]
    step_scores: Option<Vec<f64>>,
}

fn default_finished() -> bool {
    true
}

/// Parsed rollouts plus lookup tables feeding the replay adapters.
struct RecordedStep {
    rollouts: Vec<Rollout>,
    verifier_scores: HashMap<(String, String), f64>,
    step_scores: HashMap<Vec<u32>, Vec<f64>>,
}

fn load_rollouts(path: &PathBuf) -> Result<RecordedStep> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rollouts from {}", path.display()))?;
    let records: Vec<RolloutRecord> = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse rollouts from {}", path.display()))?;

    let mut rollouts = Vec::with_capacity(records.len());
    let mut verifier_scores = HashMap::new();
    let mut step_scores = HashMap::new();

    for record in records {
        let id = if record.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            record.id
        };
        if let Some(score) = record.verifier_score {
            verifier_scores.insert((record.prompt.clone(), record.response.clone()), score);
        }
        if let Some(scores) = record.step_scores {
            step_scores.insert(record.response_tokens.clone(), scores);
        }
        rollouts.push(Rollout {
            id,
            prompt: record.prompt,
            response: record.response,
            prompt_tokens: record.prompt_tokens,
            response_tokens: record.response_tokens,
            step_boundaries: record.step_boundaries,
            group_id: record.group_id,
            finished: record.finished,
            policy_log_probs: record.policy_log_probs,
            ref_log_probs: record.ref_log_probs,
        });
    }

    Ok(RecordedStep {
        rollouts,
        verifier_scores,
        step_scores,
    })
}

/// A verifier that replays the scores recorded alongside the rollouts.
fn replay_verifier(scores: HashMap<(String, String), f64>) -> Box<dyn Verifier> {
    Box::new(FnVerifier(move |prompt: &str, response: &str| {
        scores
            .get(&(prompt.to_string(), response.to_string()))
            .copied()
            .unwrap_or(0.0)
    }))
}

/// A step scorer that replays recorded per-step scores, keyed by the
/// generated token sequence. Unrecorded rollouts score as unavailable.
fn replay_step_scorer(scores: HashMap<Vec<u32>, Vec<f64>>) -> Box<dyn StepScorer> {
    Box::new(FnStepScorer(
        move |_: &[u32], response: &[u32], _: &[usize]| {
            scores
                .get(response)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no recorded step scores for rollout"))
        },
    ))
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load or create configuration.
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str::<PipelineConfig>(&text)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        }
        None => PipelineConfig::default(),
    };

    // Fill in the judge API key from the environment when not set in the file.
    if config.judge.api_key.is_empty() {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.judge.api_key = key;
        }
    }

    match cli.command {
        Commands::Step { rollouts, output } => cmd_step(config, &rollouts, &output).await,
        Commands::Pack { rollouts, budget } => cmd_pack(config, &rollouts, budget),
        Commands::CheckConfig => cmd_check_config(&config),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_step(config: PipelineConfig, rollouts: &PathBuf, output: &PathBuf) -> Result<()> {
    let step = load_rollouts(rollouts)?;
    tracing::info!(
        rollouts = step.rollouts.len(),
        path = %rollouts.display(),
        "Loaded recorded rollouts"
    );

    let verifier = config
        .sources
        .verifier_enabled
        .then(|| replay_verifier(step.verifier_scores));
    let scorer = config
        .sources
        .prm_enabled
        .then(|| replay_step_scorer(step.step_scores));

    let pipeline = RewardPipeline::new(config, verifier, scorer)?;
    let result = pipeline.process_step(step.rollouts).await?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&serde_json::json!({
        "batches": result.batches,
        "report": result.report,
    }))?;
    std::fs::write(output, json)?;

    tracing::info!(
        batches = result.report.num_batches,
        excluded = result.report.excluded.len(),
        mean_advantage = result.report.mean_advantage,
        path = %output.display(),
        "Saved step output"
    );
    Ok(())
}

fn cmd_pack(mut config: PipelineConfig, rollouts: &PathBuf, budget: Option<usize>) -> Result<()> {
    if let Some(budget) = budget {
        config.scheduler.token_budget = budget;
    }
    config.validate()?;

    let step = load_rollouts(rollouts)?;
    let plan = BatchScheduler::new(config.scheduler.clone()).pack(&step.rollouts);

    println!(
        "Packing plan: {} rollouts, budget {} tokens, {} batches ({} oversized)",
        step.rollouts.len(),
        config.scheduler.token_budget,
        plan.batches.len(),
        plan.num_oversized(),
    );
    for (i, batch) in plan.batches.iter().enumerate() {
        let ids: Vec<&str> = batch
            .indices
            .iter()
            .map(|&j| step.rollouts[j].id.as_str())
            .collect();
        println!(
            "  batch {i}: {} tokens, {} rollouts{} [{}]",
            batch.total_tokens,
            batch.indices.len(),
            if batch.oversized { ", OVERSIZED" } else { "" },
            ids.join(", "),
        );
    }
    Ok(())
}

fn cmd_check_config(config: &PipelineConfig) -> Result<()> {
    config.validate()?;
    println!("configuration OK");
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
