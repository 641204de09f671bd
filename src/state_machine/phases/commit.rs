use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::{
    model::ParameterSet,
    state_machine::{
        events::ModelUpdate,
        phases::{
            CommittedRound,
            Distribute,
            Done,
            Phase,
            PhaseError,
            PhaseName,
            PhaseState,
            Shared,
        },
        StateMachine,
    },
    transport::Transport,
};

/// The commit state.
#[derive(Debug)]
pub struct Commit {
    /// The aggregated global model of the round.
    global: Arc<ParameterSet>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Commit, T>
where
    T: Transport,
{
    const NAME: PhaseName = PhaseName::Committed;

    /// Replaces the global model and advances the round, then runs the commit hook.
    async fn process(&mut self) -> Result<(), PhaseError> {
        let round = self.shared.round_id();
        self.shared
            .coordinator
            .commit(self.private.global.as_ref().clone())?;
        info!("committed the global model of round {}", round);

        let Shared {
            coordinator, hook, ..
        } = &mut self.shared;
        let coordinator = &*coordinator;
        if let Some(hook) = hook {
            hook(&CommittedRound {
                round,
                params: coordinator.global(),
                coordinator,
            });
        }
        Ok(())
    }

    fn broadcast(&mut self) {
        info!("broadcasting the new global model");
        self.shared
            .events
            .broadcast_model(ModelUpdate::New(self.private.global.clone()));
    }

    fn next(self) -> StateMachine<T> {
        if self.shared.is_finished() {
            PhaseState::<Done, _>::new(self.shared, None).into()
        } else {
            PhaseState::<Distribute, _>::new(self.shared).into()
        }
    }
}

impl<T> PhaseState<Commit, T> {
    /// Creates a new commit state.
    pub fn new(shared: Shared<T>, global: ParameterSet) -> Self {
        Self {
            private: Commit {
                global: Arc::new(global),
            },
            shared,
        }
    }
}
