//! Shoal: reward aggregation and credit assignment for RL post-training of
//! language models.
//!
//! Turns raw reward signals (rule-based verifiers, process reward models,
//! LLM judges) into per-token advantage arrays and token-budget micro-batches
//! ready for a policy optimizer.

pub mod config;
pub mod error;
pub mod reward;
pub mod rollout;
pub mod training;
