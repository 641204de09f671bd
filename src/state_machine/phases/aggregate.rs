use async_trait::async_trait;
use tracing::info;

use crate::{
    message::RoundMessage,
    model::ParameterSet,
    state_machine::{
        phases::{Commit, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    transport::Transport,
};

/// The aggregate state.
#[derive(Debug)]
pub struct Aggregate {
    /// The local updates of the round.
    updates: Vec<RoundMessage>,
    /// The weighted average of the local updates.
    global: Option<ParameterSet>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Aggregate, T>
where
    T: Transport,
{
    const NAME: PhaseName = PhaseName::Aggregating;

    async fn process(&mut self) -> Result<(), PhaseError> {
        info!("aggregating {} local updates", self.private.updates.len());
        let global = self.shared.coordinator.aggregate(&self.private.updates)?;
        self.private.global = Some(global);
        Ok(())
    }

    fn next(self) -> StateMachine<T> {
        match self.private.global {
            Some(global) => PhaseState::<Commit, _>::new(self.shared, global).into(),
            None => self.into_failure_state(PhaseError::Internal("no aggregated model")),
        }
    }
}

impl<T> PhaseState<Aggregate, T> {
    /// Creates a new aggregate state.
    pub fn new(shared: Shared<T>, updates: Vec<RoundMessage>) -> Self {
        Self {
            private: Aggregate {
                updates,
                global: None,
            },
            shared,
        }
    }
}
