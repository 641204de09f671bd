//! Messages exchanged between the coordinator and the participants.
//!
//! In the co-located mode the messages are handed over as plain values. In the distributed mode
//! they are wrapped in a [`Frame`] and encoded with `bincode`; the byte layout is the one of the
//! `serde` representation below, parameter sets being sequences of name → tensor entries.

use bytes::Bytes;
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    common::{ParticipantId, Rank},
    model::ParameterSet,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The local parameters of a participant at the end of a round.
pub struct RoundMessage {
    /// The participant that trained the parameters.
    pub sender: ParticipantId,
    /// The round the parameters were trained for.
    pub round: u64,
    /// The number of private samples of the participant.
    pub sample_count: u64,
    /// The locally trained parameters.
    pub params: ParameterSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The global parameters broadcast at the start of a round.
pub struct GlobalMessage {
    /// The round the participants should train for.
    pub round: u64,
    /// The number of local training passes.
    pub epochs: u32,
    /// The committed global parameters.
    pub params: ParameterSet,
}

#[derive(Debug, Clone, Display, PartialEq, Eq, Serialize, Deserialize)]
/// Why a run ended.
pub enum Termination {
    #[display(fmt = "completed after {} rounds", rounds)]
    Completed { rounds: u64 },
    #[display(fmt = "aborted: {}", reason)]
    Aborted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A message on the wire between two ranks.
pub enum Frame {
    /// First frame of a participant: announces its rank, identity and sample count.
    Join {
        rank: Rank,
        participant: ParticipantId,
        sample_count: u64,
    },
    /// Coordinator → participant: the global parameters of a round.
    Global(GlobalMessage),
    /// Participant → coordinator: the local parameters of a round.
    Update(RoundMessage),
    /// Participant → coordinator: the local update of a round failed.
    Failure {
        participant: ParticipantId,
        round: u64,
        reason: String,
    },
    /// Coordinator → participant: the run is over.
    Terminate(Termination),
}

impl Frame {
    /// Serializes the frame.
    pub fn encode(&self) -> Result<Bytes, bincode::Error> {
        bincode::serialize(self).map(Bytes::from)
    }

    /// Deserializes a frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// A short name of the frame kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Join { .. } => "join",
            Frame::Global(_) => "global",
            Frame::Update(_) => "update",
            Frame::Failure { .. } => "failure",
            Frame::Terminate(_) => "terminate",
        }
    }
}
