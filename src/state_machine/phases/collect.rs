use async_trait::async_trait;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::{
    common::ParticipantId,
    message::RoundMessage,
    state_machine::{
        phases::{Aggregate, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    transport::Transport,
};

/// The collect state.
#[derive(Debug)]
pub struct Collect {
    /// The instant after which missing updates aren't waited for anymore.
    deadline: Instant,
    /// The local updates received so far.
    updates: Vec<RoundMessage>,
    /// The participants whose updates didn't arrive in time.
    missing: Vec<ParticipantId>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Collect, T>
where
    T: Transport,
{
    const NAME: PhaseName = PhaseName::Collecting;

    /// Receives the local update of every participant, in ascending participant order.
    ///
    /// Updates that miss the deadline are left out, which fails the aggregation. Any other
    /// transport error fails the phase right away.
    async fn process(&mut self) -> Result<(), PhaseError> {
        let round = self.shared.round_id();
        let cohort: Vec<_> = self.shared.coordinator.cohort().collect();
        for participant in cohort {
            let received = timeout_at(
                self.private.deadline,
                self.shared.transport.receive(participant, round),
            )
            .await;
            match received {
                Ok(Ok(update)) => {
                    debug!("received the local update of participant {}", participant);
                    self.private.updates.push(update);
                }
                Ok(Err(err)) if err.is_timeout() => {
                    warn!("participant {} is missing: {}", participant, err);
                    self.private.missing.push(participant);
                }
                Ok(Err(err)) => return Err(PhaseError::Collect(err)),
                Err(_) => {
                    warn!("participant {} missed the collect deadline", participant);
                    self.private.missing.push(participant);
                }
            }
        }
        info!(
            "collected {} local updates, {} missing",
            self.private.updates.len(),
            self.private.missing.len()
        );
        Ok(())
    }

    fn next(self) -> StateMachine<T> {
        PhaseState::<Aggregate, _>::new(self.shared, self.private.updates).into()
    }
}

impl<T> PhaseState<Collect, T> {
    /// Creates a new collect state.
    pub fn new(shared: Shared<T>, deadline: Instant) -> Self {
        Self {
            private: Collect {
                deadline,
                updates: Vec::new(),
                missing: Vec::new(),
            },
            shared,
        }
    }
}
