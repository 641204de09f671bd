use async_trait::async_trait;
use tokio::time::Instant;
use tracing::info;

use crate::{
    state_machine::{
        phases::{Collect, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    transport::Transport,
};

/// The local update state.
///
/// The participants train on their private data. Participants of the distributed mode started
/// as soon as they received the global model, the co-located ones have been updated one after
/// the other during the distribution. The orchestrator only fixes the time by which it expects
/// the local updates.
#[derive(Debug)]
pub struct LocalUpdate {
    collect_deadline: Option<Instant>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<LocalUpdate, T>
where
    T: Transport,
{
    const NAME: PhaseName = PhaseName::LocalUpdating;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let timeout = self.shared.settings.collect_timeout();
        info!("expecting the local updates within {:?}", timeout);
        self.private.collect_deadline = Some(Instant::now() + timeout);
        Ok(())
    }

    fn next(self) -> StateMachine<T> {
        let deadline = self
            .private
            .collect_deadline
            .unwrap_or_else(|| Instant::now() + self.shared.settings.collect_timeout());
        PhaseState::<Collect, _>::new(self.shared, deadline).into()
    }
}

impl<T> PhaseState<LocalUpdate, T> {
    /// Creates a new local update state.
    pub fn new(shared: Shared<T>) -> Self {
        Self {
            private: LocalUpdate {
                collect_deadline: None,
            },
            shared,
        }
    }
}
