//! Credit assignment, advantage estimation, batch scheduling, and the
//! training-step coordinator tying them together.

pub mod advantage;
pub mod credit;
pub mod pipeline;
pub mod scheduler;

pub use advantage::{AdvantageEstimator, CreditSet, EstimateOutput};
pub use credit::assign_credit;
pub use pipeline::{OptimizerSink, RewardPipeline, RolloutSource, StepOutput};
pub use scheduler::{BatchScheduler, PackPlan, PackedBatch};
