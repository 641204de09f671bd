//! This module provides the `PhaseStates` of the [`StateMachine`].
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

mod aggregate;
mod collect;
mod commit;
mod distribute;
mod done;
mod failure;
mod idle;
mod local_update;
mod phase;

pub use self::{
    aggregate::Aggregate,
    collect::Collect,
    commit::Commit,
    distribute::Distribute,
    done::Done,
    failure::{Failure, PhaseError, RunError, RunFailure},
    idle::Idle,
    local_update::LocalUpdate,
    phase::{CommitHook, CommittedRound, Phase, PhaseName, PhaseState, Shared},
};
