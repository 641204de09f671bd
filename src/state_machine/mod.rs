//! The state machine that orchestrates the FedAVG rounds.
//!
//! # Overview
//!
//! The [`StateMachine`] drives a fixed number of rounds over a [`Transport`]. It doesn't know
//! whether the participants live in the same process ([`DirectTransport`]) or behind the links
//! of a process group ([`MessageTransport`]): the round logic is the same in both modes.
//!
//! ```text
//! Idle -> Distributing -> LocalUpdating -> Collecting -> Aggregating -> Committed
//!  |           ^                                                          |
//!  |           +-------------------- next round --------------------------+
//!  |                                                                      |
//!  +-----------------------------> Done <----------- last round ----------+
//!
//! any round phase -> Failure -> Done
//! ```
//!
//! # Phase states
//!
//! **Idle**
//!
//! Publishes [`PhaseName::Idle`] and announces the run. Goes straight to **Done** if there are no
//! rounds to run.
//!
//! **Distributing**
//!
//! Publishes [`PhaseName::Distributing`] and sends a copy of the global model to every
//! participant, in ascending participant order.
//!
//! **LocalUpdating**
//!
//! Publishes [`PhaseName::LocalUpdating`]. The participants train on their private data, the
//! orchestrator fixes the deadline of the collection.
//!
//! **Collecting**
//!
//! Publishes [`PhaseName::Collecting`] and receives the local update of every participant. A
//! participant that misses the deadline is left out; any other transport error fails the round.
//!
//! **Aggregating**
//!
//! Publishes [`PhaseName::Aggregating`] and computes the average of the local updates weighted by
//! the sample counts. Fails unless every participant contributed exactly one valid update.
//!
//! **Committed**
//!
//! Publishes [`PhaseName::Committed`], replaces the global model, runs the commit hook and
//! publishes the new global model. Starts the next round or goes to **Done**.
//!
//! **Failure**
//!
//! Publishes [`PhaseName::Failure`] and logs the [`RunError`]. Failures are never retried.
//!
//! **Done**
//!
//! Publishes [`PhaseName::Done`], terminates every participant and hands out the last committed
//! [`GlobalState`].
//!
//! # Run deadline and interrupt
//!
//! If the [`RunContext`] carries a deadline, every phase races it. Once it elapses the run fails,
//! which still terminates the participants. A phase that completes without yielding is checked
//! against the deadline before and after its tasks.
//!
//! An interrupt channel set with [`StateMachineInitializer::with_interrupt()`] aborts the run the
//! same way.
//!
//! # Events
//!
//! Everyone interested in the progress of the run can subscribe to the phase and model events via
//! the [`EventSubscriber`] returned by [`StateMachineInitializer::init()`].
//!
//! [`DirectTransport`]: crate::transport::DirectTransport
//! [`MessageTransport`]: crate::transport::MessageTransport
//! [`GlobalState`]: crate::coordinator::GlobalState
//! [`RunContext`]: crate::common::RunContext

pub mod events;
mod initializer;
pub mod phases;
#[cfg(test)]
mod tests;

use derive_more::From;

pub use self::initializer::{StateMachineInitializationError, StateMachineInitializer};
use self::phases::{
    Aggregate,
    Collect,
    Commit,
    Distribute,
    Done,
    Failure,
    Idle,
    LocalUpdate,
    PhaseState,
    RunFailure,
};
use crate::{coordinator::GlobalState, transport::Transport};

/// The state machine with all its states.
#[derive(From)]
pub enum StateMachine<T> {
    Idle(PhaseState<Idle, T>),
    Distribute(PhaseState<Distribute, T>),
    LocalUpdate(PhaseState<LocalUpdate, T>),
    Collect(PhaseState<Collect, T>),
    Aggregate(PhaseState<Aggregate, T>),
    Commit(PhaseState<Commit, T>),
    Failure(PhaseState<Failure, T>),
    Done(PhaseState<Done, T>),
}

impl<T> StateMachine<T>
where
    T: Transport,
{
    /// Moves the [`StateMachine`] to the next state and consumes the current one.
    ///
    /// The [`Done`] state is terminal and is returned as is.
    pub async fn next(self) -> Self {
        match self {
            StateMachine::Idle(state) => state.run_phase().await,
            StateMachine::Distribute(state) => state.run_phase().await,
            StateMachine::LocalUpdate(state) => state.run_phase().await,
            StateMachine::Collect(state) => state.run_phase().await,
            StateMachine::Aggregate(state) => state.run_phase().await,
            StateMachine::Commit(state) => state.run_phase().await,
            StateMachine::Failure(state) => state.run_phase().await,
            StateMachine::Done(state) => state.into(),
        }
    }

    /// Runs the state machine until all the rounds are committed or the run fails.
    pub async fn run(mut self) -> Result<GlobalState, RunFailure> {
        loop {
            self = match self {
                StateMachine::Done(state) => return state.finish().await,
                state => state.next().await,
            };
        }
    }
}
