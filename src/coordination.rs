use thiserror::Error;

/// The per-step decision replicated from the coordinator rank to every
/// cooperating worker before the step runs.
///
/// All ranks must derive the same batch composition from identical inputs;
/// the only values that need actual transport are the termination flag and
/// the number of newly arrived requests to admit into the pending queue this
/// step. Everything downstream (admission, preemption, batch order) is a
/// deterministic function of those plus prior state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepDecision {
    /// Coordinated shutdown: after a terminating step, no further steps run
    pub terminate: bool,
    /// Number of new requests every rank must take from its intake before
    /// this step
    pub num_new_requests: usize,
}

/// `StepCoordinator` trait - the interface-level hook for multi-process
/// rank-parallel deployments.
///
/// Cross-process fan-out is message passing, not shared state: the
/// coordinator's decision is broadcast, and every rank proceeds with the
/// returned (authoritative) value. Divergence between ranks is a correctness
/// failure and must surface as `CoordinationError::Desynchronized`, which is
/// fatal for the whole serving instance.
pub trait StepCoordinator: Send {
    /// True on the rank whose decisions are authoritative
    fn is_coordinator(&self) -> bool;

    /// Broadcasts `decision` from the coordinator rank; every rank returns
    /// the coordinator's value. Called exactly once per step on every rank.
    fn broadcast(&mut self, decision: StepDecision) -> Result<StepDecision, CoordinationError>;
}

/// Identity coordinator for single-process deployments: the local decision
/// is authoritative.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalCoordinator;

impl StepCoordinator for LocalCoordinator {
    fn is_coordinator(&self) -> bool {
        true
    }

    fn broadcast(&mut self, decision: StepDecision) -> Result<StepDecision, CoordinationError> {
        Ok(decision)
    }
}

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("Ranks diverged on step composition: `{0}`")]
    Desynchronized(String),
    #[error("Broadcast transport failure: `{0}`")]
    Transport(String),
}
