use async_trait::async_trait;
use tracing::info;

use crate::{
    state_machine::{
        phases::{Distribute, Done, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    transport::Transport,
};

/// The idle state.
#[derive(Debug)]
pub struct Idle;

#[async_trait]
impl<T> Phase<T> for PhaseState<Idle, T>
where
    T: Transport,
{
    const NAME: PhaseName = PhaseName::Idle;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let Shared {
            coordinator,
            settings,
            context,
            ..
        } = &self.shared;
        info!(
            "starting run {}: {} rounds of {} epochs with {} participants holding {} samples on {}",
            context.run_id,
            settings.num_rounds,
            settings.epochs,
            coordinator.cohort_size(),
            coordinator.total_samples(),
            context.device,
        );
        Ok(())
    }

    fn next(self) -> StateMachine<T> {
        if self.shared.is_finished() {
            info!("no rounds to run");
            PhaseState::<Done, _>::new(self.shared, None).into()
        } else {
            PhaseState::<Distribute, _>::new(self.shared).into()
        }
    }
}

impl<T> PhaseState<Idle, T> {
    /// Creates a new idle state.
    pub fn new(shared: Shared<T>) -> Self {
        Self {
            private: Idle,
            shared,
        }
    }
}
