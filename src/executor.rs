use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};

use thiserror::Error;
use tokenizers::Tokenizer;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, info_span, instrument, Span};

use crate::{
    config::{CacheConfig, ExecutorConfig, SchedulerConfig},
    coordination::StepCoordinator,
    engine::{DeltaPayload, Engine, EngineError, GenerationDelta, NewRequest, StatsSnapshot},
    model_executor::{ModelThreadDispatcher, ModelThreadError, StepModel},
    scheduler::Scheduler,
    sequence::{FinishReason, Sequence},
    types::GenerateRequest,
    validation::{Validation, ValidationError},
};

/// Reserved request id. Never assigned to a submission; id allocation wraps
/// around it.
pub const TERMINATE_REQUEST_ID: u64 = 0;

/// The completed generation of one request.
#[derive(Clone, Debug)]
pub struct GenerationResult {
    /// The request id
    pub request_id: u64,
    /// Every generated token id, in order
    pub token_ids: Vec<u32>,
    /// Why generation ended
    pub finish_reason: FinishReason,
}

/// `GenerationExecutor` - the submission front-end of the serving instance.
///
/// Owns the engine task and the model thread. Submission, cancellation, and
/// stats consumption are safe from any thread while the engine loop runs;
/// per-request results are consumed through the [`GenerationHandle`] each
/// submission returns.
pub struct GenerationExecutor {
    /// Request validation front-end
    validation: Validation,
    /// Intake channel into the engine loop
    request_sender: mpsc::UnboundedSender<NewRequest>,
    /// Next id to assign; guards allocation and enqueueing together so ids
    /// agree with arrival order
    next_request_id: Mutex<u64>,
    /// Request ids flagged for cancellation, observed by the engine at step
    /// boundaries
    cancelled: Arc<RwLock<HashSet<u64>>>,
    /// Coordinated shutdown flag
    terminating: Arc<AtomicBool>,
    /// Completion queue, one id per finished request
    completed_receiver: flume::Receiver<u64>,
    /// Completions popped from the queue by a waiter whose set they did not
    /// belong to, held for the waiter they do belong to
    unclaimed_completions: Mutex<VecDeque<u64>>,
    /// Latest-wins stats channel
    stats_receiver: flume::Receiver<StatsSnapshot>,
    /// Optional tokenizer, shared with handles for text decoding
    tokenizer: Option<Arc<Tokenizer>>,
    /// Engine task handle, taken by `shutdown`
    engine_handle: Mutex<Option<JoinHandle<Result<(), EngineError>>>>,
    /// Tracing span
    span: Span,
}

impl GenerationExecutor {
    /// Loads the artifact, spawns the model thread and the engine loop, and
    /// returns the running executor. Must be called from within a tokio
    /// runtime.
    #[instrument(skip_all)]
    pub fn start<M, C>(
        config: ExecutorConfig,
        cache_config: CacheConfig,
        scheduler_config: SchedulerConfig,
        tokenizer: Option<Arc<Tokenizer>>,
        coordinator: C,
    ) -> Result<Self, ExecutorError>
    where
        M: StepModel + Send + 'static,
        C: StepCoordinator + 'static,
    {
        let validation = Validation::new(&cache_config, scheduler_config.policy(), tokenizer.clone());
        let scheduler = Scheduler::new(&cache_config, scheduler_config);
        let dispatcher =
            ModelThreadDispatcher::start::<M>(config.engine_dir().clone(), config.max_beam_width())?;

        let (request_sender, request_receiver) = mpsc::unbounded_channel();
        let (completed_sender, completed_receiver) = flume::unbounded();
        let (stats_sender, stats_receiver) = flume::bounded(1);
        let cancelled = Arc::new(RwLock::new(HashSet::new()));
        let terminating = Arc::new(AtomicBool::new(false));

        let engine = Engine::new(
            request_receiver,
            scheduler,
            dispatcher,
            completed_sender,
            stats_sender,
            stats_receiver.clone(),
            cancelled.clone(),
            terminating.clone(),
            coordinator,
            config.step_poll_period(),
        );
        let engine_handle = tokio::spawn(engine.run());
        info!("executor started, artifact at {:?}", config.engine_dir());

        Ok(Self {
            validation,
            request_sender,
            next_request_id: Mutex::new(TERMINATE_REQUEST_ID + 1),
            cancelled,
            terminating,
            completed_receiver,
            unclaimed_completions: Mutex::new(VecDeque::new()),
            stats_receiver,
            tokenizer,
            engine_handle: Mutex::new(Some(engine_handle)),
            span: info_span!("executor"),
        })
    }

    /// Validates and enqueues one request, returning the handle its results
    /// are consumed through. Ids ascend with submission order and wrap
    /// without ever producing [`TERMINATE_REQUEST_ID`].
    #[instrument(skip_all)]
    pub fn submit(&self, request: GenerateRequest) -> Result<GenerationHandle, ExecutorError> {
        let _enter = self.span.enter();
        let valid = self.validation.validate(request)?;

        let (result_sender, result_receiver) = flume::unbounded();
        let request_id = {
            let mut next = self
                .next_request_id
                .lock()
                .map_err(|e| ExecutorError::LockError(e.to_string()))?;
            let request_id = *next;
            *next = request_id % (u64::MAX - 1) + 1;
            self.request_sender
                .send(NewRequest {
                    sequence: Sequence::new(request_id, valid),
                    result_sender,
                })
                .map_err(|_| ExecutorError::Shutdown)?;
            request_id
        };

        Ok(GenerationHandle {
            request_id,
            receiver: result_receiver,
            token_ids: vec![],
            finish_reason: None,
            error: None,
            done: false,
            tokenizer: self.tokenizer.clone(),
        })
    }

    /// Submits a batch of requests in order, returning their handles.
    pub fn submit_batch(
        &self,
        requests: Vec<GenerateRequest>,
    ) -> Result<Vec<GenerationHandle>, ExecutorError> {
        requests
            .into_iter()
            .map(|request| self.submit(request))
            .collect()
    }

    /// Submits one request and blocks the calling thread until it completes.
    pub fn generate(&self, request: GenerateRequest) -> Result<GenerationResult, ExecutorError> {
        let mut handle = self.submit(request)?;
        handle.result()
    }

    /// Submits one request and awaits its completion.
    pub async fn generate_async(
        &self,
        request: GenerateRequest,
    ) -> Result<GenerationResult, ExecutorError> {
        let mut handle = self.submit(request)?;
        handle.aresult().await
    }

    /// Flags a request for cancellation. Takes effect at the next step
    /// boundary; unknown and already finished ids are ignored there.
    #[instrument(skip(self))]
    pub fn cancel(&self, request_id: u64) -> Result<(), ExecutorError> {
        self.cancelled
            .write()
            .map_err(|e| ExecutorError::LockError(e.to_string()))?
            .insert(request_id);
        Ok(())
    }

    /// Blocks until the first request of `handles` completes, returning its
    /// id. Requests of the set that already completed are yielded first, in
    /// finish order. Each completion is reported exactly once across all
    /// waiters: a completion belonging to a different set is kept for that
    /// set's waiter, and waiting again on the same set moves on to its next
    /// completion. A `None` timeout waits indefinitely; expiry surfaces as
    /// the distinct [`ExecutorError::Timeout`].
    pub fn wait_first_completed(
        &self,
        handles: &[GenerationHandle],
        timeout: Option<Duration>,
    ) -> Result<u64, ExecutorError> {
        let wait_set: HashSet<u64> = handles.iter().map(|h| h.request_id()).collect();
        if let Some(request_id) = self.claim_completion(&wait_set)? {
            return Ok(request_id);
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let request_id = match deadline {
                Some(deadline) => self
                    .completed_receiver
                    .recv_deadline(deadline)
                    .map_err(|e| match e {
                        flume::RecvTimeoutError::Timeout => ExecutorError::Timeout,
                        flume::RecvTimeoutError::Disconnected => ExecutorError::Shutdown,
                    })?,
                None => self
                    .completed_receiver
                    .recv()
                    .map_err(|_| ExecutorError::Shutdown)?,
            };
            if wait_set.contains(&request_id) {
                return Ok(request_id);
            }
            self.stash_completion(request_id)?;
        }
    }

    /// Async variant of [`Self::wait_first_completed`].
    pub async fn await_first_completed(
        &self,
        handles: &[GenerationHandle],
    ) -> Result<u64, ExecutorError> {
        let wait_set: HashSet<u64> = handles.iter().map(|h| h.request_id()).collect();
        if let Some(request_id) = self.claim_completion(&wait_set)? {
            return Ok(request_id);
        }
        loop {
            let request_id = self
                .completed_receiver
                .recv_async()
                .await
                .map_err(|_| ExecutorError::Shutdown)?;
            if wait_set.contains(&request_id) {
                return Ok(request_id);
            }
            self.stash_completion(request_id)?;
        }
    }

    /// Takes the oldest stashed completion belonging to `wait_set`, if any.
    fn claim_completion(&self, wait_set: &HashSet<u64>) -> Result<Option<u64>, ExecutorError> {
        let mut unclaimed = self
            .unclaimed_completions
            .lock()
            .map_err(|e| ExecutorError::LockError(e.to_string()))?;
        if let Some(pos) = unclaimed.iter().position(|id| wait_set.contains(id)) {
            return Ok(unclaimed.remove(pos));
        }
        Ok(None)
    }

    /// Keeps a completion popped on behalf of some other set's waiter.
    fn stash_completion(&self, request_id: u64) -> Result<(), ExecutorError> {
        self.unclaimed_completions
            .lock()
            .map_err(|e| ExecutorError::LockError(e.to_string()))?
            .push_back(request_id);
        Ok(())
    }

    /// Blocks until a stats snapshot is available and returns it. Under a
    /// slow consumer intermediate snapshots are dropped in favor of the most
    /// recent one.
    pub fn get_stats(&self) -> Result<StatsSnapshot, ExecutorError> {
        self.stats_receiver
            .recv()
            .map_err(|_| ExecutorError::Shutdown)
    }

    /// Async variant of [`Self::get_stats`].
    pub async fn await_stats(&self) -> Result<StatsSnapshot, ExecutorError> {
        self.stats_receiver
            .recv_async()
            .await
            .map_err(|_| ExecutorError::Shutdown)
    }

    /// Initiates coordinated shutdown and awaits the engine loop. Requests
    /// still in flight receive a final error payload; deltas already
    /// enqueued remain consumable through their handles.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) -> Result<(), ExecutorError> {
        self.terminating.store(true, Ordering::SeqCst);
        let handle = self
            .engine_handle
            .lock()
            .map_err(|e| ExecutorError::LockError(e.to_string()))?
            .take();
        if let Some(handle) = handle {
            handle.await??;
        }
        info!("executor shut down");
        Ok(())
    }
}

/// `GenerationHandle` - the consumer side of one request's result channel.
///
/// Accumulates generated tokens as deltas are consumed. Dropping the handle
/// abandons the results without affecting generation; call
/// [`GenerationExecutor::cancel`] to actually stop producing.
pub struct GenerationHandle {
    /// The request id
    request_id: u64,
    /// Result channel, closed by the engine after the final delta
    receiver: flume::Receiver<GenerationDelta>,
    /// Generated token ids consumed so far
    token_ids: Vec<u32>,
    /// Why generation ended, once the final delta has been consumed
    finish_reason: Option<FinishReason>,
    /// Error payload, if the request failed
    error: Option<String>,
    /// Set once the final delta has been consumed
    done: bool,
    /// Optional tokenizer for text decoding
    tokenizer: Option<Arc<Tokenizer>>,
}

impl GenerationHandle {
    /// Getter for `request_id`
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Generated token ids consumed so far
    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    /// Checks whether the final delta has been consumed
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Getter for `finish_reason`
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Blocks until the next delta for this request arrives and folds it into
    /// the handle. A `None` timeout waits indefinitely.
    pub fn wait_step(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<GenerationDelta, ExecutorError> {
        if self.done {
            return Err(ExecutorError::AlreadyFinished(self.request_id));
        }
        let delta = match timeout {
            Some(timeout) => self.receiver.recv_timeout(timeout).map_err(|e| match e {
                flume::RecvTimeoutError::Timeout => ExecutorError::Timeout,
                flume::RecvTimeoutError::Disconnected => ExecutorError::Shutdown,
            })?,
            None => self.receiver.recv().map_err(|_| ExecutorError::Shutdown)?,
        };
        self.apply(&delta);
        Ok(delta)
    }

    /// Async variant of [`Self::wait_step`].
    pub async fn await_step(&mut self) -> Result<GenerationDelta, ExecutorError> {
        if self.done {
            return Err(ExecutorError::AlreadyFinished(self.request_id));
        }
        let delta = self
            .receiver
            .recv_async()
            .await
            .map_err(|_| ExecutorError::Shutdown)?;
        self.apply(&delta);
        Ok(delta)
    }

    /// Consumes deltas on the calling thread until the request completes.
    pub fn result(&mut self) -> Result<GenerationResult, ExecutorError> {
        while !self.done {
            self.wait_step(None)?;
        }
        self.final_result()
    }

    /// Async variant of [`Self::result`].
    pub async fn aresult(&mut self) -> Result<GenerationResult, ExecutorError> {
        while !self.done {
            self.await_step().await?;
        }
        self.final_result()
    }

    /// Decodes the accumulated tokens into text.
    pub fn text(&self) -> Result<String, ExecutorError> {
        let tokenizer = self
            .tokenizer
            .as_ref()
            .ok_or(ExecutorError::MissingTokenizer)?;
        tokenizer
            .decode(&self.token_ids, true)
            .map_err(|e| ExecutorError::Tokenizer(e.to_string()))
    }

    /// Folds one delta into the accumulated state. A streaming request
    /// extends token by token; a non-streaming request receives its whole
    /// generation in the single final delta.
    fn apply(&mut self, delta: &GenerationDelta) {
        match &delta.payload {
            DeltaPayload::Tokens(token_ids) => self.token_ids.extend_from_slice(token_ids),
            DeltaPayload::Error(message) => self.error = Some(message.clone()),
        }
        if delta.is_final {
            self.finish_reason = delta.finish_reason;
            self.done = true;
        }
    }

    fn final_result(&self) -> Result<GenerationResult, ExecutorError> {
        if let Some(message) = &self.error {
            return Err(ExecutorError::GenerationFailed {
                request_id: self.request_id,
                message: message.clone(),
            });
        }
        Ok(GenerationResult {
            request_id: self.request_id,
            token_ids: self.token_ids.clone(),
            finish_reason: self
                .finish_reason
                .ok_or(ExecutorError::Shutdown)?,
        })
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Validation error: `{0}`")]
    ValidationError(#[from] ValidationError),
    #[error("Model thread error: `{0}`")]
    ModelThreadError(#[from] ModelThreadError),
    #[error("Engine error: `{0}`")]
    EngineError(#[from] EngineError),
    #[error("Join error: `{0}`")]
    JoinError(#[from] tokio::task::JoinError),
    #[error("Serving instance has shut down")]
    Shutdown,
    #[error("Timed out waiting for a delivery")]
    Timeout,
    #[error("Request `{0}` already finished")]
    AlreadyFinished(u64),
    #[error("Request `{request_id}` failed: `{message}`")]
    GenerationFailed { request_id: u64, message: String },
    #[error("Lock error: `{0}`")]
    LockError(String),
    #[error("Text decoding requires a tokenizer, none was supplied")]
    MissingTokenizer,
    #[error("Tokenizer error: `{0}`")]
    Tokenizer(String),
}
