//! Inflight batching request scheduler for autoregressive generation serving.
//! Requests are admitted into a continuously re-composed step batch backed by
//! a paged KV cache pool, following the continuous batching architecture of
//! https://arxiv.org/pdf/2309.06180: sequences join and leave the batch at
//! step granularity instead of waiting for whole-batch completion.

pub mod block;
pub mod block_manager;
pub mod config;
pub mod coordination;
pub mod engine;
pub mod executor;
pub mod model_executor;
pub mod scheduler;
pub mod sequence;
#[cfg(test)]
pub mod tests;
pub mod types;
pub mod validation;

pub use config::{CacheConfig, ExecutorConfig, SchedulerConfig, SchedulerPolicy};
pub use coordination::{LocalCoordinator, StepCoordinator, StepDecision};
pub use engine::{DeltaPayload, GenerationDelta, StatsSnapshot};
pub use executor::{
    GenerationExecutor, GenerationHandle, GenerationResult, TERMINATE_REQUEST_ID,
};
pub use model_executor::{EngineLoader, ExecuteStepRequest, StepModel};
pub use sequence::{FinishReason, SequenceMetadata, StepOutput};
pub use types::{GenerateParameters, GenerateRequest, Prompt};
