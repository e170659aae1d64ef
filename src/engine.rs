use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use futures::StreamExt;
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, instrument, trace, Span};

use crate::{
    coordination::{CoordinationError, StepCoordinator, StepDecision},
    model_executor::{ExecuteStepRequest, ModelThreadDispatcher, ModelThreadError},
    scheduler::{Scheduler, SchedulerError, StepResult},
    sequence::{FinishReason, Sequence},
};

/// The payload of one per-request delivery: either newly generated token ids
/// or an error indicator.
#[derive(Clone, Debug, PartialEq)]
pub enum DeltaPayload {
    Tokens(Vec<u32>),
    Error(String),
}

/// One `(payload, is_final)` delivery on a request's result channel.
#[derive(Clone, Debug)]
pub struct GenerationDelta {
    /// The request id
    pub request_id: u64,
    /// Token ids or an error indicator
    pub payload: DeltaPayload,
    /// Why generation ended, set only on the final delivery
    pub finish_reason: Option<FinishReason>,
    /// True on the last delivery for this request; no further production
    /// will occur
    pub is_final: bool,
}

/// Point-in-time counters published once per step, including idle steps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Step counter at publication time
    pub iteration: u64,
    /// Requests waiting for admission
    pub num_pending: usize,
    /// Requests in the active batch
    pub num_active: usize,
    /// Requests that finished during this step
    pub num_finished_step: usize,
}

/// A newly submitted request together with the producer side of its result
/// channel.
pub(crate) struct NewRequest {
    pub(crate) sequence: Sequence,
    pub(crate) result_sender: flume::Sender<GenerationDelta>,
}

/// `Engine` - the scheduling loop.
///
/// One engine task owns every `Sequence`; submission and result consumption
/// happen concurrently from other tasks, but only this loop mutates sequence
/// state. Each pass through [`Engine::step`] admits, batches, executes one
/// artifact invocation, and demultiplexes its outputs. The loop keeps
/// stepping even with no work (idle no-op steps) so a broadcast termination
/// signal is always observed promptly.
pub struct Engine<C: StepCoordinator> {
    /// Intake channel from the executor front-end
    request_receiver: mpsc::UnboundedReceiver<NewRequest>,
    /// Requests drained from the intake channel but not yet replicated into
    /// the scheduler
    intake: VecDeque<NewRequest>,
    /// Set once the executor front-end has been dropped
    intake_closed: bool,
    /// Highest request id ever drained from the intake channel. Ids ascend
    /// with submission order, so a flagged id at or below this mark that is
    /// no longer live has already finished.
    last_seen_request_id: u64,
    /// Scheduler and sequence state store
    scheduler: Scheduler,
    /// Step executor interface
    dispatcher: ModelThreadDispatcher,
    /// Producer side of each live request's result channel
    result_senders: HashMap<u64, flume::Sender<GenerationDelta>>,
    /// Completion queue feeding `wait_first_completed`
    completed_sender: flume::Sender<u64>,
    /// Stats publication channel, bounded at one snapshot
    stats_sender: flume::Sender<StatsSnapshot>,
    /// Drain handle used to overwrite a stale unconsumed snapshot
    stats_drain: flume::Receiver<StatsSnapshot>,
    /// Request ids flagged for cancellation, shared with the executor
    cancelled: Arc<RwLock<HashSet<u64>>>,
    /// Coordinated shutdown flag, shared with the executor
    terminating: Arc<AtomicBool>,
    /// Rank coordination layer
    coordinator: C,
    /// Idle step cadence and replicated-request backoff period
    step_poll_period: Duration,
    /// Step counter
    iteration: u64,
    /// Tracing span
    span: Span,
}

impl<C: StepCoordinator> Engine<C> {
    /// Constructor
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        request_receiver: mpsc::UnboundedReceiver<NewRequest>,
        scheduler: Scheduler,
        dispatcher: ModelThreadDispatcher,
        completed_sender: flume::Sender<u64>,
        stats_sender: flume::Sender<StatsSnapshot>,
        stats_drain: flume::Receiver<StatsSnapshot>,
        cancelled: Arc<RwLock<HashSet<u64>>>,
        terminating: Arc<AtomicBool>,
        coordinator: C,
        step_poll_period: Duration,
    ) -> Self {
        Self {
            request_receiver,
            intake: VecDeque::new(),
            intake_closed: false,
            last_seen_request_id: 0,
            scheduler,
            dispatcher,
            result_senders: HashMap::new(),
            completed_sender,
            stats_sender,
            stats_drain,
            cancelled,
            terminating,
            coordinator,
            step_poll_period,
            iteration: 0,
            span: info_span!("engine"),
        }
    }

    /// Main loop. Runs until a coordinated termination step, then delivers
    /// nothing further; deltas already enqueued remain consumable.
    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<(), EngineError> {
        info!("engine loop started");

        while self.step().await? {}

        info!("engine loop terminated after {} steps", self.iteration);
        Ok(())
    }

    /// Executes one scheduling tick. Returns `false` after the coordinated
    /// shutdown step.
    async fn step(&mut self) -> Result<bool, EngineError> {
        self.drain_intake();

        // Replicate the per-step decision before anything else, so every
        // rank admits the same requests and observes termination together.
        // Worker ranks contribute nothing; only the coordinator's view of
        // its intake and termination state is authoritative.
        let local = if self.coordinator.is_coordinator() {
            StepDecision {
                terminate: self.terminating.load(Ordering::SeqCst)
                    || (self.intake_closed
                        && self.intake.is_empty()
                        && !self.scheduler.has_unfinished()),
                num_new_requests: self.intake.len(),
            }
        } else {
            StepDecision::default()
        };
        let decision = self.coordinator.broadcast(local)?;
        if decision.terminate {
            self.shutdown_step();
            return Ok(false);
        }

        self.admit(decision.num_new_requests).await;
        self.process_cancellations()?;

        let outputs = self.scheduler.schedule()?;
        counter!("engine-preempted-requests").increment(outputs.preempted_ids.len() as u64);
        for request_id in &outputs.infeasible_ids {
            self.dispatch_delta(GenerationDelta {
                request_id: *request_id,
                payload: DeltaPayload::Error("request can never fit the cache pool".into()),
                finish_reason: Some(FinishReason::Error),
                is_final: true,
            });
        }

        if outputs.scheduled.is_empty() {
            // Idle no-op step: stats still advance, termination stays
            // observable, and a worker rank picks up replicated requests on
            // the next pass.
            self.publish_stats(0);
            self.iteration += 1;
            tokio::time::sleep(self.step_poll_period).await;
            return Ok(true);
        }

        self.dispatcher.send(ExecuteStepRequest {
            sequences: outputs.scheduled,
        })?;
        let outcome = self
            .dispatcher
            .responses
            .next()
            .await
            .ok_or(ModelThreadError::Shutdown)?
            .map_err(ModelThreadError::RecvError)?;

        let num_finished = match outcome {
            Ok(step_outputs) => {
                let results = self.scheduler.process_step_outputs(&step_outputs)?;
                self.dispatch_results(results)
            }
            Err(e) => {
                // The whole step failed: every batched request gets the
                // error as its final payload. No automatic retry.
                let aborted = self.scheduler.abort_running()?;
                let num_aborted = aborted.len();
                for request_id in aborted {
                    self.dispatch_delta(GenerationDelta {
                        request_id,
                        payload: DeltaPayload::Error(e.to_string()),
                        finish_reason: Some(FinishReason::Error),
                        is_final: true,
                    });
                }
                num_aborted
            }
        };

        self.publish_stats(num_finished);
        self.iteration += 1;
        Ok(true)
    }

    /// Moves newly arrived requests from the intake channel into the local
    /// intake queue, without blocking.
    fn drain_intake(&mut self) {
        loop {
            match self.request_receiver.try_recv() {
                Ok(request) => {
                    self.last_seen_request_id = self
                        .last_seen_request_id
                        .max(request.sequence.request_id());
                    self.intake.push_back(request);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.intake_closed = true;
                    break;
                }
            }
        }
    }

    /// Admits exactly the replicated number of new requests into the
    /// scheduler. A rank whose intake lags the coordinator waits with a
    /// bounded backoff poll rather than spinning or proceeding with a stale
    /// view.
    async fn admit(&mut self, num_new_requests: usize) {
        while self.intake.len() < num_new_requests {
            tokio::time::sleep(self.step_poll_period).await;
            self.drain_intake();
        }
        for _ in 0..num_new_requests {
            let NewRequest {
                sequence,
                result_sender,
            } = self.intake.pop_front().expect("intake length checked");
            trace!("admitting request {} into pending queue", sequence.request_id());
            self.result_senders
                .insert(sequence.request_id(), result_sender);
            self.scheduler.add_sequence(sequence);
            counter!("engine-requests-total").increment(1);
        }
    }

    /// Observes cancellation flags at the step boundary: each flagged live
    /// request leaves the store, releases its blocks, and receives a
    /// synthesized final Cancelled payload.
    ///
    /// A flag is consumed only once it is resolved. A flag for a request the
    /// engine has not yet seen (still inside the intake channel) or not yet
    /// admitted stays set until the request reaches the scheduler; a flag for
    /// an id that already finished is dropped as stale.
    fn process_cancellations(&mut self) -> Result<(), EngineError> {
        let flagged: Vec<u64> = {
            let cancelled = self
                .cancelled
                .read()
                .map_err(|e| EngineError::LockError(e.to_string()))?;
            cancelled.iter().copied().collect()
        };

        let mut resolved = Vec::new();
        for request_id in flagged {
            if self.scheduler.cancel(request_id)?.is_some() {
                debug!("request {request_id} cancelled");
                counter!("engine-cancelled-requests").increment(1);
                self.dispatch_delta(GenerationDelta {
                    request_id,
                    payload: DeltaPayload::Tokens(vec![]),
                    finish_reason: Some(FinishReason::Cancelled),
                    is_final: true,
                });
                resolved.push(request_id);
            } else if self
                .intake
                .iter()
                .any(|r| r.sequence.request_id() == request_id)
            {
                // Drained but not yet admitted; the flag takes effect at the
                // boundary after admission.
            } else if request_id <= self.last_seen_request_id {
                // Already finished; the flag is stale.
                resolved.push(request_id);
            }
            // Otherwise the request is still inside the intake channel; the
            // flag stays set until it becomes visible.
        }

        if !resolved.is_empty() {
            let mut cancelled = self
                .cancelled
                .write()
                .map_err(|e| EngineError::LockError(e.to_string()))?;
            for request_id in &resolved {
                cancelled.remove(request_id);
            }
        }
        Ok(())
    }

    /// Demultiplexes one step's results onto the per-request channels.
    /// Streaming requests get a delta every step; non-streaming requests get
    /// a single final payload carrying the whole generation.
    fn dispatch_results(&mut self, results: Vec<StepResult>) -> usize {
        let mut num_finished = 0;
        for result in results {
            let is_final = result.finish_reason.is_some();
            if is_final {
                num_finished += 1;
            }
            if result.streaming {
                self.dispatch_delta(GenerationDelta {
                    request_id: result.request_id,
                    payload: DeltaPayload::Tokens(result.new_token_ids),
                    finish_reason: result.finish_reason,
                    is_final,
                });
            } else if is_final {
                self.dispatch_delta(GenerationDelta {
                    request_id: result.request_id,
                    payload: DeltaPayload::Tokens(result.output_token_ids),
                    finish_reason: result.finish_reason,
                    is_final,
                });
            }
        }
        num_finished
    }

    /// Single producer-side entry point onto a request's result channel,
    /// called only from the demultiplexing path. On a final delta the
    /// completion queue is signalled and the channel is closed.
    fn dispatch_delta(&mut self, delta: GenerationDelta) {
        let request_id = delta.request_id;
        let is_final = delta.is_final;
        if let Some(sender) = self.result_senders.get(&request_id) {
            // A consumer that dropped its handle simply stops receiving.
            sender.send(delta).ok();
        }
        if is_final {
            counter!("engine-finished-requests").increment(1);
            self.completed_sender.send(request_id).ok();
            self.result_senders.remove(&request_id);
        }
    }

    /// Publishes the step's snapshot, replacing any unconsumed one: under a
    /// slow consumer intermediate snapshots are dropped, never the most
    /// recent.
    fn publish_stats(&self, num_finished_step: usize) {
        let _enter = self.span.enter();
        let snapshot = StatsSnapshot {
            iteration: self.iteration,
            num_pending: self.scheduler.num_pending(),
            num_active: self.scheduler.num_active(),
            num_finished_step,
        };
        while self.stats_sender.is_full() {
            if self.stats_drain.try_recv().is_err() {
                break;
            }
        }
        self.stats_sender.try_send(snapshot).ok();

        gauge!("engine-pending-requests").set(snapshot.num_pending as f64);
        gauge!("engine-active-requests").set(snapshot.num_active as f64);
        gauge!("engine-free-blocks")
            .set(self.scheduler.block_manager().num_free_blocks() as f64);
    }

    /// The coordinated shutdown step: no further steps run, but every still
    /// unfinished request gets a final payload so no consumer blocks
    /// forever. Deltas enqueued earlier remain consumable by their channels.
    fn shutdown_step(&mut self) {
        self.publish_stats(0);
        let live: Vec<u64> = self.result_senders.keys().copied().collect();
        for request_id in live {
            self.dispatch_delta(GenerationDelta {
                request_id,
                payload: DeltaPayload::Error("serving instance terminated".into()),
                finish_reason: Some(FinishReason::Error),
                is_final: true,
            });
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Coordination error: `{0}`")]
    CoordinationError(#[from] CoordinationError),
    #[error("Scheduler error: `{0}`")]
    SchedulerError(#[from] SchedulerError),
    #[error("Model thread error: `{0}`")]
    ModelThreadError(#[from] ModelThreadError),
    #[error("Lock error: `{0}`")]
    LockError(String),
}
