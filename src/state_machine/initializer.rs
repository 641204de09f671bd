use std::{collections::BTreeSet, sync::Arc};

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::{
    common::{ParticipantId, RunContext},
    coordinator::Coordinator,
    settings::FederationSettings,
    state_machine::{
        events::{EventPublisher, EventSubscriber, ModelUpdate},
        phases::{CommitHook, CommittedRound, Idle, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    transport::Transport,
};

type StateMachineInitializationResult<T> = Result<T, StateMachineInitializationError>;

/// Error that can occur during the initialization of the [`StateMachine`].
#[derive(Debug, Error)]
pub enum StateMachineInitializationError {
    #[error(
        "the transport reaches {reachable:?} but the coordinator registered {registered:?}"
    )]
    CohortMismatch {
        registered: Vec<ParticipantId>,
        reachable: Vec<ParticipantId>,
    },
}

/// The state machine initializer that initializes a new state machine.
pub struct StateMachineInitializer<T> {
    settings: FederationSettings,
    coordinator: Coordinator,
    transport: T,
    context: RunContext,
    hook: Option<CommitHook>,
    interrupt: Option<watch::Receiver<bool>>,
}

impl<T> StateMachineInitializer<T>
where
    T: Transport,
{
    /// Creates a new [`StateMachineInitializer`].
    pub fn new(
        settings: FederationSettings,
        coordinator: Coordinator,
        transport: T,
        context: RunContext,
    ) -> Self {
        Self {
            settings,
            coordinator,
            transport,
            context,
            hook: None,
            interrupt: None,
        }
    }

    /// Sets a hook which is called after every committed round, e.g. to evaluate the global
    /// model.
    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&CommittedRound<'_>) + Send + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Aborts the run as soon as `true` is sent on the `interrupt` channel.
    ///
    /// The participants are terminated as for any other failure.
    pub fn with_interrupt(mut self, interrupt: watch::Receiver<bool>) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Initializes a new [`StateMachine`] in the idle state.
    ///
    /// The deadline of the run starts counting now.
    pub fn init(self) -> StateMachineInitializationResult<(StateMachine<T>, EventSubscriber)> {
        let registered: BTreeSet<_> = self.coordinator.cohort().collect();
        let reachable: BTreeSet<_> = self.transport.cohort().into_iter().collect();
        if registered != reachable {
            return Err(StateMachineInitializationError::CohortMismatch {
                registered: registered.into_iter().collect(),
                reachable: reachable.into_iter().collect(),
            });
        }
        debug!("the transport reaches all {} participants", registered.len());

        let (event_publisher, event_subscriber) = EventPublisher::init(
            self.coordinator.round(),
            PhaseName::Idle,
            ModelUpdate::New(Arc::new(self.coordinator.distribute())),
        );
        let shared = Shared::new(
            self.coordinator,
            self.transport,
            event_publisher,
            self.settings,
            self.context,
            self.hook,
            self.interrupt,
        );
        let state_machine = StateMachine::from(PhaseState::<Idle, _>::new(shared));
        Ok((state_machine, event_subscriber))
    }
}
