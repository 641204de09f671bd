use tracing::{error_span, info};
use tracing_futures::Instrument;

use crate::{
    coordinator::GlobalState,
    message::Termination,
    state_machine::phases::{PhaseName, PhaseState, RunError, RunFailure, Shared},
    transport::Transport,
};

/// The terminal state.
///
/// Terminates every participant and hands out the outcome of the run. Unlike the other states
/// it doesn't lead anywhere.
#[derive(Debug)]
pub struct Done {
    error: Option<RunError>,
}

impl<T> PhaseState<Done, T> {
    /// Creates a new done state, `error` being the reason of an aborted run.
    pub fn new(shared: Shared<T>, error: Option<RunError>) -> Self {
        Self {
            private: Done { error },
            shared,
        }
    }
}

impl<T> PhaseState<Done, T>
where
    T: Transport,
{
    /// Terminates the participants and returns the outcome of the run.
    pub async fn finish(mut self) -> Result<GlobalState, RunFailure> {
        let phase = PhaseName::Done;
        let span = error_span!("run_phase", phase = %phase, round = self.shared.round_id());

        async move {
            info!("starting phase");
            self.shared.events.broadcast_phase(phase);

            let termination = match &self.private.error {
                None => Termination::Completed {
                    rounds: self.shared.round_id(),
                },
                Some(error) => Termination::Aborted {
                    reason: error.to_string(),
                },
            };
            self.shared.transport.shutdown(termination).await;

            let last_committed = self.shared.coordinator.into_state();
            match self.private.error {
                None => {
                    info!(
                        "run {} completed after {} rounds",
                        self.shared.context.run_id, last_committed.round
                    );
                    Ok(last_committed)
                }
                Some(error) => {
                    info!(
                        "run {} aborted after {} committed rounds",
                        self.shared.context.run_id, last_committed.round
                    );
                    Err(RunFailure {
                        error,
                        last_committed,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }
}
