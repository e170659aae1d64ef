use std::collections::VecDeque;

use thiserror::Error;
use tracing::{debug, info_span, instrument, trace, warn, Span};

use crate::{
    block_manager::{AllocationStatus, BlockManager, BlockManagerError},
    config::{CacheConfig, SchedulerConfig, SchedulerPolicy},
    sequence::{FinishReason, Sequence, SequenceMetadata, StepOutput},
};

/// `SchedulerOutputs` - the scheduling decision for one engine step.
#[derive(Clone, Debug)]
pub struct SchedulerOutputs {
    /// The step batch, in ascending request id order. This order is stable
    /// and matches the order the step executor's outputs are demultiplexed
    /// in.
    pub scheduled: Vec<SequenceMetadata>,
    /// Requests preempted back to pending this step
    pub preempted_ids: Vec<u64>,
    /// Requests the pool can never satisfy, removed from the queues; the
    /// engine fails them with an error payload
    pub infeasible_ids: Vec<u64>,
}

impl SchedulerOutputs {
    /// Checks whether nothing was scheduled and nothing needs reporting
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty() && self.preempted_ids.is_empty() && self.infeasible_ids.is_empty()
    }
}

/// The demultiplexed outcome of one step for a single request, ready to be
/// dispatched on its result channel.
#[derive(Clone, Debug)]
pub struct StepResult {
    /// The request id
    pub request_id: u64,
    /// Tokens appended this step, after stop-condition truncation
    pub new_token_ids: Vec<u32>,
    /// All generated tokens so far, for non-streaming final delivery
    pub output_token_ids: Vec<u32>,
    /// Set when the sequence finished this step
    pub finish_reason: Option<FinishReason>,
    /// Whether the caller asked for per-step streaming
    pub streaming: bool,
}

/// `Scheduler` - owns the sequence state store and decides, each engine step,
/// which pending requests enter the active batch and which active sequences
/// must be preempted to free capacity.
///
/// Both queues are kept in ascending request id order, which is arrival
/// order. All decisions are pure functions of queue contents and pool state,
/// so cooperating ranks fed identical requests compose identical batches.
#[derive(Debug)]
pub struct Scheduler {
    /// Scheduler configuration
    config: SchedulerConfig,
    /// The paged KV cache pool
    block_manager: BlockManager,
    /// Pending sequences, ascending request id
    waiting: VecDeque<Sequence>,
    /// Active sequences, ascending request id
    running: Vec<Sequence>,
    /// Tracing span
    span: Span,
}

impl Scheduler {
    /// Constructor
    pub fn new(cache_config: &CacheConfig, config: SchedulerConfig) -> Self {
        Self {
            config,
            block_manager: BlockManager::new(cache_config),
            waiting: VecDeque::new(),
            running: Vec::new(),
            span: info_span!("scheduler"),
        }
    }

    /// Getter for the configured admission policy
    pub fn policy(&self) -> SchedulerPolicy {
        self.config.policy()
    }

    /// Read access to the pool, for stats and tests
    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    /// Number of pending sequences
    pub fn num_pending(&self) -> usize {
        self.waiting.len()
    }

    /// Number of active sequences
    pub fn num_active(&self) -> usize {
        self.running.len()
    }

    /// Checks whether any sequence is still pending or active
    pub fn has_unfinished(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty()
    }

    /// Adds a newly submitted sequence to the pending queue.
    #[instrument(skip_all, fields(request_id = sequence.request_id()))]
    pub fn add_sequence(&mut self, sequence: Sequence) {
        trace!("adding sequence to waiting queue");
        self.insert_waiting(sequence);
    }

    /// Removes a request from the store, releasing its blocks if it was
    /// active. Returns the cancelled sequence, or `None` for an unknown or
    /// already finished id.
    #[instrument(skip(self))]
    pub fn cancel(&mut self, request_id: u64) -> Result<Option<Sequence>, SchedulerError> {
        if let Some(idx) = self.waiting.iter().position(|s| s.request_id() == request_id) {
            let mut sequence = self.waiting.remove(idx).expect("index in bounds");
            sequence.cancel();
            return Ok(Some(sequence));
        }
        if let Some(idx) = self.running.iter().position(|s| s.request_id() == request_id) {
            let mut sequence = self.running.remove(idx);
            self.block_manager.free(request_id)?;
            sequence.cancel();
            return Ok(Some(sequence));
        }
        Ok(None)
    }

    /// Composes the step batch.
    ///
    /// First every active sequence's block list is extended to cover its
    /// current length (decode growth). Under `MaxUtilization`, extension
    /// failure preempts the most recently arrived active sequence, returning
    /// it to pending with its generated prefix retained; under
    /// `GuaranteedNoEvict` extension cannot fail for an admitted sequence.
    /// Then pending sequences are admitted in strict arrival order while
    /// capacity and the batch size limit allow; the first request that does
    /// not fit stops admission, so a large request cannot be starved by
    /// smaller later ones.
    #[instrument(skip_all)]
    pub fn schedule(&mut self) -> Result<SchedulerOutputs, SchedulerError> {
        let mut preempted_ids = Vec::new();
        let mut infeasible_ids = Vec::new();

        // Decode growth for the active batch, oldest first.
        let mut idx = 0;
        while idx < self.running.len() {
            let request_id = self.running[idx].request_id();
            let new_total_len = self.running[idx].total_len();
            loop {
                if self
                    .block_manager
                    .append_slot(request_id, new_total_len)?
                {
                    idx += 1;
                    break;
                }
                if self.config.policy() == SchedulerPolicy::GuaranteedNoEvict {
                    // Reservations guarantee growth; running dry here means
                    // the accounting is broken.
                    return Err(SchedulerError::ReservationViolated(request_id));
                }
                let victim_is_self = self.preempt_last_running(&mut preempted_ids);
                if victim_is_self == request_id {
                    break;
                }
            }
        }

        // Admission, strict FIFO by request id.
        while let Some(front) = self.waiting.front() {
            if self.running.len() >= self.config.max_num_sequences() {
                break;
            }
            match self.block_manager.can_admit(front, self.config.policy()) {
                AllocationStatus::Never => {
                    let sequence = self.waiting.pop_front().expect("front exists");
                    warn!(
                        "request {} can never fit the pool, dropping",
                        sequence.request_id()
                    );
                    infeasible_ids.push(sequence.request_id());
                }
                AllocationStatus::Later => break,
                AllocationStatus::Ok => {
                    let mut sequence = self.waiting.pop_front().expect("front exists");
                    self.block_manager
                        .allocate(&sequence, self.config.policy())?;
                    sequence.activate();
                    debug!("admitted request {}", sequence.request_id());
                    self.insert_running(sequence);
                }
            }
        }

        let scheduled = self
            .running
            .iter()
            .map(|sequence| {
                let request_id = sequence.request_id();
                SequenceMetadata {
                    request_id,
                    input_token_ids: sequence.next_input_token_ids(),
                    position: sequence.num_computed_tokens(),
                    block_table: self
                        .block_manager
                        .block_table_ids(request_id)
                        .expect("active sequence owns blocks"),
                    sampling_params: sequence.params().clone(),
                    is_prefill: sequence.is_prefill(),
                }
            })
            .collect();

        Ok(SchedulerOutputs {
            scheduled,
            preempted_ids,
            infeasible_ids,
        })
    }

    /// Applies one step's outputs to the active batch, in batch order.
    ///
    /// Sequences that finish (stop token, length cap, or artifact finished
    /// flag) release their blocks immediately and leave the store.
    ///
    /// # Errors
    ///
    /// A mismatch between the batch and the outputs is a protocol violation
    /// of the step executor contract and is fatal for the serving instance.
    #[instrument(skip_all)]
    pub fn process_step_outputs(
        &mut self,
        outputs: &[StepOutput],
    ) -> Result<Vec<StepResult>, SchedulerError> {
        if outputs.len() != self.running.len() {
            return Err(SchedulerError::BatchMismatch {
                expected: self.running.len(),
                actual: outputs.len(),
            });
        }

        let mut results = Vec::with_capacity(outputs.len());
        let mut finished_ids = Vec::new();
        for (sequence, output) in self.running.iter_mut().zip(outputs) {
            if sequence.request_id() != output.request_id {
                return Err(SchedulerError::BatchOrderMismatch {
                    expected: sequence.request_id(),
                    actual: output.request_id,
                });
            }

            sequence.mark_computed();
            let new_token_ids = sequence.advance(&output.token_ids);
            if output.finished && !sequence.status().is_finished() {
                sequence.stop();
            }

            let finish_reason = sequence.status().finish_reason();
            if finish_reason.is_some() {
                finished_ids.push(sequence.request_id());
            }
            results.push(StepResult {
                request_id: sequence.request_id(),
                new_token_ids,
                output_token_ids: sequence.output_token_ids().to_vec(),
                finish_reason,
                streaming: sequence.is_streaming(),
            });
        }

        for request_id in &finished_ids {
            self.block_manager.free(*request_id)?;
        }
        self.running.retain(|s| !s.status().is_finished());
        Ok(results)
    }

    /// Drops the whole active batch after a failed artifact step, releasing
    /// every scheduled sequence's blocks. Returns the dropped request ids in
    /// batch order.
    #[instrument(skip_all)]
    pub fn abort_running(&mut self) -> Result<Vec<u64>, SchedulerError> {
        let ids: Vec<u64> = self.running.iter().map(|s| s.request_id()).collect();
        for request_id in &ids {
            self.block_manager.free(*request_id)?;
        }
        self.running.clear();
        Ok(ids)
    }

    /// Preempts the most recently arrived active sequence, freeing its blocks
    /// and returning it to the pending queue with its prefix retained.
    /// Returns the victim's request id.
    fn preempt_last_running(&mut self, preempted_ids: &mut Vec<u64>) -> u64 {
        let mut victim = self
            .running
            .pop()
            .expect("preemption requires an active sequence");
        let request_id = victim.request_id();
        self.block_manager
            .free(request_id)
            .expect("active sequence owns blocks");
        victim.preempt();
        debug!("preempted request {request_id}");
        preempted_ids.push(request_id);
        self.insert_waiting(victim);
        request_id
    }

    /// Inserts into the waiting queue keeping ascending id order
    fn insert_waiting(&mut self, sequence: Sequence) {
        let pos = self
            .waiting
            .partition_point(|s| s.request_id() < sequence.request_id());
        self.waiting.insert(pos, sequence);
    }

    /// Inserts into the running list keeping ascending id order
    fn insert_running(&mut self, sequence: Sequence) {
        let pos = self
            .running
            .partition_point(|s| s.request_id() < sequence.request_id());
        self.running.insert(pos, sequence);
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Block manager error: `{0}`")]
    BlockManagerError(#[from] BlockManagerError),
    #[error("Reservation accounting violated for request `{0}` under GuaranteedNoEvict")]
    ReservationViolated(u64),
    #[error("Step output count mismatch: batch has `{expected}` sequences, got `{actual}` outputs")]
    BatchMismatch { expected: usize, actual: usize },
    #[error("Step output order mismatch: expected request `{expected}`, got `{actual}`")]
    BatchOrderMismatch { expected: u64, actual: u64 },
}
