use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    message::GlobalMessage,
    state_machine::{
        phases::{LocalUpdate, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    transport::Transport,
};

/// The distribute state.
#[derive(Debug)]
pub struct Distribute;

#[async_trait]
impl<T> Phase<T> for PhaseState<Distribute, T>
where
    T: Transport,
{
    const NAME: PhaseName = PhaseName::Distributing;

    /// Sends the global model to every participant, in ascending participant order.
    async fn process(&mut self) -> Result<(), PhaseError> {
        let msg = GlobalMessage {
            round: self.shared.round_id(),
            epochs: self.shared.settings.epochs,
            params: self.shared.coordinator.distribute(),
        };
        let cohort: Vec<_> = self.shared.coordinator.cohort().collect();
        info!("distributing the global model to {} participants", cohort.len());
        for participant in cohort {
            debug!("sending the global model to participant {}", participant);
            self.shared
                .transport
                .send(participant, msg.clone())
                .await
                .map_err(PhaseError::Distribute)?;
        }
        Ok(())
    }

    fn next(self) -> StateMachine<T> {
        PhaseState::<LocalUpdate, _>::new(self.shared).into()
    }
}

impl<T> PhaseState<Distribute, T> {
    /// Creates a new distribute state.
    pub fn new(mut shared: Shared<T>) -> Self {
        // events of this round carry its id from the start
        let round_id = shared.round_id();
        shared.events.set_round_id(round_id);
        Self {
            private: Distribute,
            shared,
        }
    }
}
