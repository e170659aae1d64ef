use std::path::{Path, PathBuf};

use futures::stream::FuturesUnordered;
use thiserror::Error;
use tokio::{
    sync::{
        mpsc,
        oneshot::{self, error::RecvError},
    },
    task::JoinHandle,
};
use tracing::{error, info, info_span, instrument, trace, Span};

use crate::sequence::{SequenceMetadata, StepOutput};

/// One artifact invocation's worth of work: the step batch composed by the
/// scheduler, in demultiplexing order.
#[derive(Clone, Debug)]
pub struct ExecuteStepRequest {
    /// Per-sequence inputs, ascending request id
    pub sequences: Vec<SequenceMetadata>,
}

/// `EngineLoader` trait - interface for loading the external compiled
/// generation artifact. How the artifact is produced is out of scope; the
/// serving core only needs its directory and execution policy parameters.
pub trait EngineLoader {
    /// Loads the compiled artifact from `engine_dir`.
    fn load(engine_dir: &Path, max_beam_width: usize) -> Result<Self, EngineLoaderError>
    where
        Self: Sized;
}

/// `StepModel` trait - the callable compiled artifact.
///
/// Invoked exactly once per scheduling tick with exactly the sequences the
/// scheduler selected. Outputs must be positionally aligned with the input
/// batch; each carries one newly generated token, or several under
/// speculative multi-token steps.
pub trait StepModel: EngineLoader {
    /// Runs one generation step over the batch.
    ///
    /// A failure here fails the whole step: the engine reports it
    /// per-request as an error payload and does not retry.
    fn execute_step(
        &mut self,
        request: &ExecuteStepRequest,
    ) -> Result<Vec<StepOutput>, StepModelError>;
}

/// `ModelThreadCommand` - encapsulates one step request and the channel its
/// outcome is sent back on
pub struct ModelThreadCommand {
    /// The step batch to execute
    request: ExecuteStepRequest,
    /// One-shot channel for communicating the step outcome back to the
    /// engine loop
    sender: oneshot::Sender<Result<Vec<StepOutput>, StepModelError>>,
}

/// `ModelThread` - runs the compiled artifact on a dedicated blocking thread,
/// processing step requests in arrival order.
pub struct ModelThread<M: StepModel> {
    /// The loaded artifact
    model: M,
    /// Receiver for incoming step requests
    receiver: mpsc::UnboundedReceiver<ModelThreadCommand>,
    /// Tracing span
    span: Span,
}

impl<M> ModelThread<M>
where
    M: StepModel + Send,
{
    /// Main loop of the model thread.
    ///
    /// Step failures are sent back to the engine like successes; they are a
    /// per-step condition, not a reason to tear the thread down. The loop
    /// ends when the engine drops the command sender.
    #[instrument(skip(self))]
    pub fn run(mut self) {
        let _enter = self.span.enter();
        info!("model thread started");

        while let Some(command) = self.receiver.blocking_recv() {
            let ModelThreadCommand { request, sender } = command;
            let outcome = self.model.execute_step(&request);
            if let Err(e) = &outcome {
                error!("step execution failed: {e}");
            }
            // The engine may have shut down mid-step; nothing to do then.
            sender.send(outcome).ok();
        }
        info!("model thread stopped");
    }
}

/// `ModelThreadDispatcher` - the engine side of the step executor interface.
pub struct ModelThreadDispatcher {
    /// Sender for step commands to the model thread
    sender: mpsc::UnboundedSender<ModelThreadCommand>,
    /// Pending step outcomes; yields as the model thread replies
    pub responses: FuturesUnordered<oneshot::Receiver<Result<Vec<StepOutput>, StepModelError>>>,
    /// Join handle for the model thread
    pub join_handle: JoinHandle<Result<(), ModelThreadError>>,
}

impl ModelThreadDispatcher {
    /// Loads the artifact and spawns its dedicated thread.
    #[instrument(skip_all)]
    pub(crate) fn start<M>(
        engine_dir: PathBuf,
        max_beam_width: usize,
    ) -> Result<Self, ModelThreadError>
    where
        M: StepModel + Send + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();

        let join_handle = tokio::task::spawn_blocking(move || {
            let model = M::load(&engine_dir, max_beam_width)?;
            let model_thread = ModelThread {
                model,
                receiver,
                span: info_span!("model-thread"),
            };
            model_thread.run();
            Ok(())
        });

        Ok(Self {
            sender,
            responses: FuturesUnordered::new(),
            join_handle,
        })
    }

    /// Sends one step batch to the model thread. The outcome is later
    /// yielded by `responses`.
    #[instrument(skip_all)]
    pub fn send(&self, request: ExecuteStepRequest) -> Result<(), ModelThreadError> {
        trace!(
            "dispatching step batch of {} sequences",
            request.sequences.len()
        );
        let (sender, receiver) = oneshot::channel();
        self.sender
            .send(ModelThreadCommand { request, sender })
            .map_err(|_| ModelThreadError::Shutdown)?;
        self.responses.push(receiver);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ModelThreadError {
    #[error("Model thread shut down")]
    Shutdown,
    #[error("Model thread reply dropped: `{0}`")]
    RecvError(#[from] RecvError),
    #[error("Engine loader error: `{0}`")]
    EngineLoaderError(#[from] EngineLoaderError),
}

#[derive(Debug, Error)]
pub enum EngineLoaderError {
    #[error("Io error: `{0}`")]
    IoError(#[from] std::io::Error),
    #[error("Malformed artifact: `{0}`")]
    MalformedArtifact(String),
}

#[derive(Debug, Error)]
pub enum StepModelError {
    #[error("Step execution failed: `{0}`")]
    ExecutionFailed(String),
}
