use async_trait::async_trait;
use thiserror::Error;
use tracing::error;

use crate::{
    common::ParticipantId,
    coordinator::{AggregationError, GlobalState},
    model::ShapeMismatch,
    state_machine::{
        phases::{Done, Phase, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    transport::{Transport, TransportError},
};

/// Errors which can occur during the execution of the [`StateMachine`].
#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("the run deadline elapsed")]
    RunDeadline,
    #[error("the run was interrupted")]
    Interrupted,
    #[error("distributing the global model failed: {0}")]
    Distribute(#[source] TransportError),
    #[error("collecting the local updates failed: {0}")]
    Collect(#[source] TransportError),
    #[error("aggregation failed: {0}")]
    Aggregate(#[from] AggregationError),
    #[error("committing the global model failed: {0}")]
    Commit(#[from] ShapeMismatch),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl PhaseError {
    /// The participant that caused the error, if known.
    pub fn participant(&self) -> Option<ParticipantId> {
        match self {
            PhaseError::Distribute(err) | PhaseError::Collect(err) => err.participant(),
            PhaseError::Aggregate(err) => err.participant(),
            PhaseError::RunDeadline
            | PhaseError::Interrupted
            | PhaseError::Commit(_)
            | PhaseError::Internal(_) => None,
        }
    }
}

/// The error that ended a run.
#[derive(Error, Debug)]
#[error("round {round} failed in the {phase} phase: {source}")]
pub struct RunError {
    /// The round that failed.
    pub round: u64,
    /// The phase that failed.
    pub phase: PhaseName,
    /// The participant at fault, if known.
    pub participant: Option<ParticipantId>,
    pub source: PhaseError,
}

/// A failed run, along with the last committed global state.
#[derive(Error, Debug)]
#[error("run failed: {error}")]
pub struct RunFailure {
    #[source]
    pub error: RunError,
    pub last_committed: GlobalState,
}

/// The failure state.
#[derive(Debug)]
pub struct Failure {
    pub(in crate::state_machine) error: RunError,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Failure, T>
where
    T: Transport,
{
    const NAME: PhaseName = PhaseName::Failure;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let error = &self.private.error;
        match error.participant {
            Some(participant) => error!("participant {}: {}", participant, error),
            None => error!("{}", error),
        }
        Ok(())
    }

    fn next(self) -> StateMachine<T> {
        PhaseState::<Done, _>::new(self.shared, Some(self.private.error)).into()
    }
}

impl<T> PhaseState<Failure, T> {
    /// Creates a new failure state.
    pub fn new(shared: Shared<T>, error: RunError) -> Self {
        Self {
            private: Failure { error },
            shared,
        }
    }
}
