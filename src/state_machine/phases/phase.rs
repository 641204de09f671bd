use std::fmt;

use async_trait::async_trait;
use derive_more::Display;
use futures::future;
use tokio::{
    sync::watch,
    time::{sleep_until, Instant},
};
use tracing::{error_span, info, warn};
use tracing_futures::Instrument;

use crate::{
    common::RunContext,
    coordinator::Coordinator,
    model::ParameterSet,
    settings::FederationSettings,
    state_machine::{
        events::EventPublisher,
        phases::{Failure, PhaseError, RunError},
        StateMachine,
    },
    transport::Transport,
};

/// The name of the current phase.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "Idle")]
    Idle,
    #[display(fmt = "Distributing")]
    Distributing,
    #[display(fmt = "LocalUpdating")]
    LocalUpdating,
    #[display(fmt = "Collecting")]
    Collecting,
    #[display(fmt = "Aggregating")]
    Aggregating,
    #[display(fmt = "Committed")]
    Committed,
    #[display(fmt = "Failure")]
    Failure,
    #[display(fmt = "Done")]
    Done,
}

/// A trait that must be implemented by a state in order to move to a next state.
///
/// See the [module level documentation] for more details.
///
/// [module level documentation]: crate::state_machine
#[async_trait]
pub trait Phase<T>
where
    T: Transport,
{
    /// The name of the current phase.
    const NAME: PhaseName;

    /// Performs the tasks of this phase.
    async fn process(&mut self) -> Result<(), PhaseError>;

    /// Broadcasts data of this phase (nothing by default).
    fn broadcast(&mut self) {}

    /// Moves from this phase to the next phase.
    fn next(self) -> StateMachine<T>;
}

/// What a commit hook gets to see of a committed round.
#[derive(Debug)]
pub struct CommittedRound<'a> {
    /// The round that has just been committed.
    pub round: u64,
    /// The new global parameters.
    pub params: &'a ParameterSet,
    pub coordinator: &'a Coordinator,
}

/// A callback invoked after every commit, e.g. for evaluating the global model.
pub type CommitHook = Box<dyn FnMut(&CommittedRound<'_>) + Send>;

/// A struct that contains the coordinator and the I/O interfaces that are shared and accessible
/// by all `PhaseState`s.
pub struct Shared<T> {
    /// The coordinator owning the global state.
    pub(in crate::state_machine) coordinator: Coordinator,
    /// The transport to the participants.
    pub(in crate::state_machine) transport: T,
    /// The event publisher.
    pub(in crate::state_machine) events: EventPublisher,
    pub(in crate::state_machine) settings: FederationSettings,
    pub(in crate::state_machine) context: RunContext,
    /// The instant at which the run is aborted, if any.
    pub(in crate::state_machine) deadline: Option<Instant>,
    pub(in crate::state_machine) hook: Option<CommitHook>,
    /// Aborts the run once it holds `true`.
    pub(in crate::state_machine) interrupt: Option<watch::Receiver<bool>>,
}

impl<T> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("coordinator", &self.coordinator)
            .field("events", &self.events)
            .field("settings", &self.settings)
            .field("context", &self.context)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl<T> Shared<T> {
    /// Creates a new shared state.
    pub fn new(
        coordinator: Coordinator,
        transport: T,
        events: EventPublisher,
        settings: FederationSettings,
        context: RunContext,
        hook: Option<CommitHook>,
        interrupt: Option<watch::Receiver<bool>>,
    ) -> Self {
        let deadline = context.deadline.map(|deadline| Instant::now() + deadline);
        Self {
            coordinator,
            transport,
            events,
            settings,
            context,
            deadline,
            hook,
            interrupt,
        }
    }

    /// Returns the current round ID.
    pub fn round_id(&self) -> u64 {
        self.coordinator.round()
    }

    /// Checks whether the run is over its deadline or has been interrupted.
    fn aborted(&self) -> Option<PhaseError> {
        if matches!(self.deadline, Some(deadline) if Instant::now() >= deadline) {
            Some(PhaseError::RunDeadline)
        } else if matches!(&self.interrupt, Some(interrupt) if *interrupt.borrow()) {
            Some(PhaseError::Interrupted)
        } else {
            None
        }
    }

    /// Checks whether all the configured rounds have been committed.
    pub fn is_finished(&self) -> bool {
        self.coordinator.round() >= self.settings.num_rounds
    }
}

/// The state corresponding to a phase of the FedAVG round.
///
/// This contains the state-dependent `private` state and the state-independent `shared` state
/// which is shared across state transitions.
pub struct PhaseState<S, T> {
    /// The private state.
    pub(in crate::state_machine) private: S,
    /// The shared coordinator state and I/O interfaces.
    pub(in crate::state_machine) shared: Shared<T>,
}

impl<S, T> PhaseState<S, T>
where
    S: Send,
    T: Transport,
    Self: Phase<T>,
{
    /// Runs the current phase to completion.
    ///
    /// 1. Performs the phase tasks, racing the run deadline and the interrupt.
    /// 2. Broadcasts the phase data.
    /// 3. Transitions to the next phase.
    pub async fn run_phase(mut self) -> StateMachine<T> {
        let phase = Self::NAME;
        let span = error_span!("run_phase", phase = %phase, round = self.shared.round_id());

        async move {
            info!("starting phase");
            self.shared.events.broadcast_phase(phase);

            // the failure phase must always get through to termination
            let processed = if phase == PhaseName::Failure {
                self.process().await
            } else {
                self.process_unless_aborted().await
            };
            if let Err(err) = processed {
                warn!("failed to perform the phase tasks");
                return self.into_failure_state(err);
            }
            info!("phase ran successfully");

            self.broadcast();

            info!("transitioning to the next phase");
            self.next()
        }
        .instrument(span)
        .await
    }

    /// Performs the phase tasks, failing once the deadline has elapsed or the run is interrupted.
    ///
    /// A phase that never yields, like a co-located local update, completes within its first
    /// poll, so both are also checked on either side of it.
    async fn process_unless_aborted(&mut self) -> Result<(), PhaseError> {
        if let Some(err) = self.shared.aborted() {
            return Err(err);
        }
        let deadline = self.shared.deadline;
        let interrupt = self.shared.interrupt.clone();
        let processed = tokio::select! {
            processed = self.process() => processed,
            _ = elapsed(deadline) => return Err(PhaseError::RunDeadline),
            _ = interrupted(interrupt) => return Err(PhaseError::Interrupted),
        };
        processed?;
        self.shared.aborted().map_or(Ok(()), Err)
    }

    pub(in crate::state_machine) fn into_failure_state(self, err: PhaseError) -> StateMachine<T> {
        let error = RunError {
            round: self.shared.round_id(),
            phase: Self::NAME,
            participant: err.participant(),
            source: err,
        };
        PhaseState::<Failure, _>::new(self.shared, error).into()
    }
}

async fn elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Resolves once `true` is sent. A dropped sender never interrupts.
async fn interrupted(interrupt: Option<watch::Receiver<bool>>) {
    if let Some(mut interrupt) = interrupt {
        while !*interrupt.borrow() {
            if interrupt.changed().await.is_err() {
                return future::pending().await;
            }
        }
        return;
    }
    future::pending().await
}
