//! Moving parameters between the coordinator and the participants.
//!
//! The round orchestration is written once against the [`Transport`] trait. Two
//! implementations exist:
//!
//! - [`DirectTransport`]: the co-located mode. Participants live in the coordinator's process and
//!   "sending" the global model to one of them runs its local update right away.
//! - [`MessageTransport`]: the distributed mode. Every participant is a separate rank of a
//!   [`ProcessGroup`] and the messages travel as encoded [`Frame`]s over a link. Participants run
//!   a [`RemoteParticipant`] on their side of the link.
//!
//! [`Frame`]: crate::message::Frame

mod direct;
pub mod group;
mod message;
mod remote;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::{
    direct::DirectTransport,
    group::{GroupError, LocalGroup, ProcessGroup, RankMap, Role, Uplink},
    message::MessageTransport,
    remote::RemoteParticipant,
};
use crate::{
    common::{ParticipantId, Rank},
    message::{GlobalMessage, RoundMessage, Termination},
};

#[derive(Debug, Error)]
/// Errors which can occur while exchanging messages with the participants.
pub enum TransportError {
    #[error("participant {participant} didn't answer within {after:?}")]
    Timeout {
        participant: ParticipantId,
        after: Duration,
    },
    #[error("rank {rank} of participant {participant} is unreachable")]
    RankUnreachable {
        rank: Rank,
        participant: ParticipantId,
    },
    #[error("participant {participant} failed its local update of round {round}: {reason}")]
    ParticipantFailed {
        participant: ParticipantId,
        round: u64,
        reason: String,
    },
    #[error("participant {0} is not reachable over this transport")]
    UnknownParticipant(ParticipantId),
    #[error("expected a message from participant {expected}, found one from {found}")]
    UnexpectedSender {
        expected: ParticipantId,
        found: ParticipantId,
    },
    #[error("failed to encode or decode a frame: {0}")]
    Codec(#[from] bincode::Error),
}

impl TransportError {
    /// The participant the error relates to, if any.
    pub fn participant(&self) -> Option<ParticipantId> {
        match self {
            TransportError::Timeout { participant, .. }
            | TransportError::RankUnreachable { participant, .. }
            | TransportError::ParticipantFailed { participant, .. }
            | TransportError::UnexpectedSender {
                expected: participant,
                ..
            } => Some(*participant),
            TransportError::UnknownParticipant(participant) => Some(*participant),
            TransportError::Codec(_) => None,
        }
    }

    /// Whether the error only means that the participant's answer didn't arrive in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// The coordinator's view on the participants of a run.
#[async_trait]
pub trait Transport: Send {
    /// The participants reachable over this transport, in ascending order.
    fn cohort(&self) -> Vec<ParticipantId>;

    /// Hands the global model of a round to a participant.
    async fn send(&mut self, to: ParticipantId, msg: GlobalMessage) -> Result<(), TransportError>;

    /// Waits for the local update of a participant for the given round.
    async fn receive(
        &mut self,
        from: ParticipantId,
        round: u64,
    ) -> Result<RoundMessage, TransportError>;

    /// Tells every reachable participant that the run is over and releases the transport.
    async fn shutdown(&mut self, termination: Termination);
}
