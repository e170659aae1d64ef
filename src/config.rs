use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Admission policy applied by the `Scheduler` each engine step.
///
/// `MaxUtilization`: greedily admits as many pending requests as fit the
/// current free capacity, maximizing batch size. Active sequences may be
/// preempted back to the pending queue when a later step's cache growth
/// cannot be satisfied; their generated prefix is retained so they resume
/// rather than restart.
///
/// `GuaranteedNoEvict`: a request, once admitted, runs to completion without
/// eviction. Admission is checked conservatively against worst-case growth,
/// assuming every admitted sequence may reach its `max_new_tokens`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchedulerPolicy {
    MaxUtilization,
    #[default]
    GuaranteedNoEvict,
}

/// Configuration for the paged KV cache pool.
///
/// Args:
///   block_size: Number of token positions covered by one cache block.
///   num_blocks: Total number of blocks in the pool, fixed at construction.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Block size, in token positions
    block_size: usize,
    /// Total number of blocks in the pool
    num_blocks: usize,
}

impl CacheConfig {
    /// Constructor
    pub fn new(block_size: usize, num_blocks: usize) -> Result<Self, CacheConfigError> {
        let this = Self {
            block_size,
            num_blocks,
        };
        this.verify_args()?;
        Ok(this)
    }

    /// Verify `CacheConfig` arguments
    fn verify_args(&self) -> Result<(), CacheConfigError> {
        if self.block_size == 0 {
            return Err(CacheConfigError::InvalidBlockSize(self.block_size));
        }
        if self.num_blocks == 0 {
            return Err(CacheConfigError::InvalidNumBlocks(self.num_blocks));
        }
        Ok(())
    }

    /// Getter for `block_size`
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Getter for `num_blocks`
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Total number of token positions the pool can hold
    pub fn total_token_capacity(&self) -> usize {
        self.block_size * self.num_blocks
    }
}

#[derive(Debug, Error)]
pub enum CacheConfigError {
    #[error("Invalid block size: `{0}`")]
    InvalidBlockSize(usize),
    #[error("Invalid number of blocks: `{0}`")]
    InvalidNumBlocks(usize),
}

/// Scheduler configuration.
///
/// Args:
///   max_num_sequences: Maximum number of sequences composing a step batch.
///   policy: Admission policy, selected at construction.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Maximum number of sequences per step batch
    max_num_sequences: usize,
    /// Admission policy
    policy: SchedulerPolicy,
}

impl SchedulerConfig {
    /// Constructor
    pub fn new(
        max_num_sequences: usize,
        policy: SchedulerPolicy,
    ) -> Result<Self, SchedulerConfigError> {
        let this = Self {
            max_num_sequences,
            policy,
        };
        this.verify_args()?;
        Ok(this)
    }

    fn verify_args(&self) -> Result<(), SchedulerConfigError> {
        if self.max_num_sequences == 0 {
            return Err(SchedulerConfigError::InvalidMaxNumSequences(
                self.max_num_sequences,
            ));
        }
        Ok(())
    }

    /// Getter for `max_num_sequences`
    pub fn max_num_sequences(&self) -> usize {
        self.max_num_sequences
    }

    /// Getter for `policy`
    pub fn policy(&self) -> SchedulerPolicy {
        self.policy
    }
}

#[derive(Debug, Error)]
pub enum SchedulerConfigError {
    #[error("Invalid maximum number of sequences: `{0}`")]
    InvalidMaxNumSequences(usize),
}

/// Default cadence of the engine loop when there is no work to execute and
/// while a worker rank waits for replicated requests to arrive.
pub const DEFAULT_STEP_POLL_PERIOD: Duration = Duration::from_millis(50);

/// Construction-time inputs of the generation executor.
///
/// The compiled generation artifact is an external collaborator; the only
/// things the serving core needs from it are the directory it is loaded from
/// and its execution policy parameters.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Directory holding the compiled generation artifact
    engine_dir: PathBuf,
    /// Maximum beam width forwarded to the artifact
    max_beam_width: usize,
    /// Cadence of idle no-op steps and of the replicated-request backoff poll
    step_poll_period: Duration,
}

impl ExecutorConfig {
    /// Constructor
    pub fn new<P: Into<PathBuf>>(
        engine_dir: P,
        max_beam_width: usize,
        step_poll_period: Option<Duration>,
    ) -> Result<Self, ExecutorConfigError> {
        let this = Self {
            engine_dir: engine_dir.into(),
            max_beam_width,
            step_poll_period: step_poll_period.unwrap_or(DEFAULT_STEP_POLL_PERIOD),
        };
        this.verify_args()?;
        Ok(this)
    }

    fn verify_args(&self) -> Result<(), ExecutorConfigError> {
        if self.max_beam_width == 0 {
            return Err(ExecutorConfigError::InvalidMaxBeamWidth(
                self.max_beam_width,
            ));
        }
        if self.step_poll_period.is_zero() {
            return Err(ExecutorConfigError::InvalidStepPollPeriod);
        }
        Ok(())
    }

    /// Getter for `engine_dir`
    pub fn engine_dir(&self) -> &PathBuf {
        &self.engine_dir
    }

    /// Getter for `max_beam_width`
    pub fn max_beam_width(&self) -> usize {
        self.max_beam_width
    }

    /// Getter for `step_poll_period`
    pub fn step_poll_period(&self) -> Duration {
        self.step_poll_period
    }
}

#[derive(Debug, Error)]
pub enum ExecutorConfigError {
    #[error("Invalid maximum beam width: `{0}`")]
    InvalidMaxBeamWidth(usize),
    #[error("Step poll period must be non-zero")]
    InvalidStepPollPeriod,
}
