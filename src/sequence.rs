use std::time::Instant;

use tracing::{info_span, Span};

use crate::validation::{SamplingParams, ValidGenerateRequest};

/// `SequenceStatus` - the lifecycle state of a sequence in the store.
///
/// Transitions only ever follow
/// `Pending -> Active -> {FinishedStopped, FinishedLengthCapped, Cancelled}`,
/// with `Active -> Pending` on preemption and `Pending -> Cancelled` when a
/// request is cancelled before admission. A finished sequence never
/// transitions again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceStatus {
    /// Waiting for admission into the active batch
    Pending,
    /// Part of the active batch, advanced by engine steps
    Active,
    /// Finished by producing its end token
    FinishedStopped,
    /// Finished by reaching `max_new_tokens`
    FinishedLengthCapped,
    /// Finished by caller cancellation
    Cancelled,
}

impl SequenceStatus {
    /// Checks if the sequence has reached a terminal state
    pub fn is_finished(&self) -> bool {
        match self {
            Self::FinishedStopped | Self::FinishedLengthCapped | Self::Cancelled => true,
            Self::Pending | Self::Active => false,
        }
    }

    /// Returns the reason the sequence finished, if it has
    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self {
            Self::FinishedStopped => Some(FinishReason::Stopped),
            Self::FinishedLengthCapped => Some(FinishReason::LengthCapped),
            Self::Cancelled => Some(FinishReason::Cancelled),
            Self::Pending | Self::Active => None,
        }
    }
}

/// Why a request's generation ended, as reported on its final payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishReason {
    /// The end token was produced
    Stopped,
    /// `max_new_tokens` was reached
    LengthCapped,
    /// The caller cancelled the request
    Cancelled,
    /// Step execution failed for this request
    Error,
}

/// `Sequence` - the mutable state of one in-flight request.
///
/// Exactly one engine step touches a given `Sequence` at a time; the store is
/// owned by the scheduling loop and never shared across threads.
#[derive(Clone, Debug)]
pub struct Sequence {
    /// Unique request id, immutable after creation
    request_id: u64,
    /// The prompt token ids, fixed once issued
    prompt_token_ids: Vec<u32>,
    /// Append-only generated token ids
    output_token_ids: Vec<u32>,
    /// Validated sampling and stopping parameters
    params: SamplingParams,
    /// Whether partial outputs are streamed per step
    streaming: bool,
    /// Number of tokens whose attention cache has been computed. Reset on
    /// preemption so the sequence re-prefills over prompt plus generated
    /// prefix when resumed.
    num_computed_tokens: usize,
    /// Lifecycle status
    status: SequenceStatus,
    /// Arrival time, for queueing metrics
    arrival_time: Instant,
    /// Tracing span
    span: Span,
}

impl Sequence {
    /// Constructor
    pub fn new(request_id: u64, request: ValidGenerateRequest) -> Self {
        Self {
            request_id,
            prompt_token_ids: request.prompt_token_ids,
            output_token_ids: vec![],
            params: request.params,
            streaming: request.streaming,
            num_computed_tokens: 0,
            status: SequenceStatus::Pending,
            arrival_time: Instant::now(),
            span: info_span!("sequence"),
        }
    }

    /// Getter for `request_id`
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Getter for `status`
    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    /// Getter for `params`
    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Getter for `streaming`
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Getter for `arrival_time`
    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    /// Length of the prompt
    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Number of generated tokens so far
    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Total sequence length, prompt plus generated tokens
    pub fn total_len(&self) -> usize {
        self.prompt_token_ids.len() + self.output_token_ids.len()
    }

    /// Getter for `output_token_ids`
    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// Prompt and generated token ids, concatenated
    pub fn token_ids(&self) -> Vec<u32> {
        let mut token_ids = self.prompt_token_ids.clone();
        token_ids.extend_from_slice(&self.output_token_ids);
        token_ids
    }

    /// Number of tokens whose attention cache has been computed
    pub fn num_computed_tokens(&self) -> usize {
        self.num_computed_tokens
    }

    /// True while some prompt (or resumed prefix) tokens still need their
    /// cache computed
    pub fn is_prefill(&self) -> bool {
        self.num_computed_tokens < self.total_len()
    }

    /// The token ids to feed the artifact on the next step: the not yet
    /// computed suffix (whole prompt during prefill, the last generated token
    /// during decode).
    pub fn next_input_token_ids(&self) -> Vec<u32> {
        self.token_ids()[self.num_computed_tokens..].to_vec()
    }

    /// Marks every token fed in the current step as computed.
    pub fn mark_computed(&mut self) {
        self.num_computed_tokens = self.total_len();
    }

    /// Worst-case number of blocks this sequence can ever hold, assuming it
    /// reaches `max_new_tokens`.
    pub fn worst_case_num_blocks(&self, block_size: usize) -> usize {
        (self.prompt_len() + self.params.max_new_tokens).div_ceil(block_size)
    }

    /// Transitions `Pending -> Active` on admission.
    ///
    /// # Panics
    ///
    /// Admitting a sequence that is not pending is a scheduler bug.
    pub fn activate(&mut self) {
        assert_eq!(
            self.status,
            SequenceStatus::Pending,
            "admitted sequence {} is not pending",
            self.request_id
        );
        self.status = SequenceStatus::Active;
    }

    /// Transitions `Active -> Pending` on preemption, retaining the generated
    /// prefix and resetting the computed-token count so the sequence resumes
    /// with a re-prefill.
    ///
    /// # Panics
    ///
    /// Preempting a sequence that is not active is a scheduler bug.
    pub fn preempt(&mut self) {
        assert_eq!(
            self.status,
            SequenceStatus::Active,
            "preempted sequence {} is not active",
            self.request_id
        );
        self.status = SequenceStatus::Pending;
        self.num_computed_tokens = 0;
    }

    /// Marks the sequence cancelled. Valid from both `Pending` and `Active`.
    ///
    /// # Panics
    ///
    /// Cancelling an already finished sequence is a scheduler bug; the store
    /// must have dropped it at finish time.
    pub fn cancel(&mut self) {
        assert!(
            !self.status.is_finished(),
            "cancelled sequence {} already finished",
            self.request_id
        );
        self.status = SequenceStatus::Cancelled;
    }

    /// Marks the sequence stopped on the artifact's own finished flag (for
    /// example beam termination).
    ///
    /// # Panics
    ///
    /// Stopping a sequence that is not `Active` is a scheduler bug.
    pub fn stop(&mut self) {
        assert_eq!(
            self.status,
            SequenceStatus::Active,
            "stopped sequence {} is not active",
            self.request_id
        );
        self.status = SequenceStatus::FinishedStopped;
    }

    /// Appends newly generated tokens and re-evaluates the stop condition.
    ///
    /// Tokens are appended one at a time (a speculative step may carry more
    /// than one); after each append the sequence stops if the token matches
    /// `end_id` or the generated length reaches `max_new_tokens`. Tokens past
    /// a stop are discarded.
    ///
    /// # Arguments
    ///
    /// * `new_token_ids` - The tokens produced for this sequence this step.
    ///
    /// # Returns
    ///
    /// The token ids actually appended.
    ///
    /// # Panics
    ///
    /// Advancing a sequence that is not `Active` is a contract violation and
    /// aborts, it is a scheduler bug rather than a user-recoverable error.
    pub fn advance(&mut self, new_token_ids: &[u32]) -> Vec<u32> {
        assert_eq!(
            self.status,
            SequenceStatus::Active,
            "advanced sequence {} is not active",
            self.request_id
        );

        let mut appended = Vec::with_capacity(new_token_ids.len());
        for &token_id in new_token_ids {
            self.output_token_ids.push(token_id);
            appended.push(token_id);

            if self.params.end_id == Some(token_id) {
                self.status = SequenceStatus::FinishedStopped;
                break;
            }
            if self.output_token_ids.len() >= self.params.max_new_tokens {
                self.status = SequenceStatus::FinishedLengthCapped;
                break;
            }
        }
        appended
    }
}

/// Per-sequence data packaged for one artifact invocation. Built by the
/// scheduler in batch order; the step executor's outputs are demultiplexed
/// back in the same order.
#[derive(Clone, Debug)]
pub struct SequenceMetadata {
    /// The request id
    pub request_id: u64,
    /// Token ids to feed this step
    pub input_token_ids: Vec<u32>,
    /// Cache position of the first fed token
    pub position: usize,
    /// Physical cache block ids assigned to the sequence, in logical order
    pub block_table: Vec<u32>,
    /// Sampling parameters forwarded to the artifact
    pub sampling_params: SamplingParams,
    /// Whether this step computes prompt cache (prefill) or decodes
    pub is_prefill: bool,
}

/// One sequence's share of an artifact invocation's output.
#[derive(Clone, Debug, PartialEq)]
pub struct StepOutput {
    /// The request id, matching the batch order
    pub request_id: u64,
    /// Newly generated token ids; more than one under speculative steps
    pub token_ids: Vec<u32>,
    /// Artifact-side finished flag (for example beam termination)
    pub finished: bool,
}
