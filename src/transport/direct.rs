use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tracing::{debug, error_span, info, warn};

use crate::{
    common::{Device, ParticipantId},
    message::{GlobalMessage, RoundMessage, Termination},
    participant::{LocalUpdateError, Participant, Trainer},
    transport::{Transport, TransportError},
};

type Outcome = Result<RoundMessage, LocalUpdateError>;

/// A transport for participants living in the coordinator's process.
///
/// Sending the global model to a participant installs it and runs the local update immediately,
/// so the participants train one at a time, in the order the orchestrator addresses them. Nothing
/// is serialized.
pub struct DirectTransport {
    participants: BTreeMap<ParticipantId, (Participant, Box<dyn Trainer + Send>)>,
    outbox: HashMap<ParticipantId, (u64, Outcome)>,
    device: Device,
    // participants added under an id that was taken already
    rejected: Vec<(ParticipantId, u64)>,
}

impl DirectTransport {
    /// Creates an empty transport whose participants train on the default device.
    pub fn new() -> Self {
        Self {
            participants: BTreeMap::new(),
            outbox: HashMap::new(),
            device: Device::default(),
            rejected: Vec::new(),
        }
    }

    /// Sets the device handed to the trainers of all the participants, added so far or later.
    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self.participants = std::mem::take(&mut self.participants)
            .into_iter()
            .map(|(id, (participant, trainer))| (id, (participant.with_device(device), trainer)))
            .collect();
        self
    }

    /// Adds a participant along with the trainer of its private data.
    ///
    /// The first participant added under an id is kept. Later ones are dropped but still show up
    /// in [`sample_counts()`], which makes [`Coordinator::initialize()`] reject the cohort.
    ///
    /// [`sample_counts()`]: DirectTransport::sample_counts
    /// [`Coordinator::initialize()`]: crate::coordinator::Coordinator::initialize
    pub fn with_participant<T>(mut self, participant: Participant, trainer: T) -> Self
    where
        T: Trainer + Send + 'static,
    {
        let id = participant.id();
        if self.participants.contains_key(&id) {
            warn!("participant {} is added twice", id);
            self.rejected.push((id, participant.sample_count()));
        } else {
            let participant = participant.with_device(self.device);
            self.participants.insert(id, (participant, Box::new(trainer)));
        }
        self
    }

    /// The sample counts of the participants, for initializing the coordinator.
    pub fn sample_counts(&self) -> Vec<(ParticipantId, u64)> {
        self.participants
            .iter()
            .map(|(id, (participant, _))| (*id, participant.sample_count()))
            .chain(self.rejected.iter().copied())
            .collect()
    }

    /// Gets a participant.
    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.get(&id).map(|(participant, _)| participant)
    }
}

impl Default for DirectTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn cohort(&self) -> Vec<ParticipantId> {
        self.participants.keys().copied().collect()
    }

    async fn send(&mut self, to: ParticipantId, msg: GlobalMessage) -> Result<(), TransportError> {
        let (participant, trainer) = self
            .participants
            .get_mut(&to)
            .ok_or(TransportError::UnknownParticipant(to))?;
        let GlobalMessage {
            round,
            epochs,
            params,
        } = msg;
        let outcome = error_span!("participant", id = %to).in_scope(|| {
            let outcome = participant
                .set_parameters(params)
                .map_err(|source| LocalUpdateError::Shape { epoch: 0, source })
                .and_then(|_| participant.local_update(trainer.as_mut(), epochs))
                .map(|(params, sample_count)| RoundMessage {
                    sender: to,
                    round,
                    sample_count,
                    params,
                });
            if let Err(err) = &outcome {
                warn!("local update failed: {}", err);
            }
            outcome
        });
        self.outbox.insert(to, (round, outcome));
        Ok(())
    }

    async fn receive(
        &mut self,
        from: ParticipantId,
        round: u64,
    ) -> Result<RoundMessage, TransportError> {
        match self.outbox.remove(&from) {
            Some((sent, Ok(msg))) if sent == round => {
                debug!("local update of participant {} ready", from);
                Ok(msg)
            }
            Some((sent, Err(err))) if sent == round => Err(TransportError::ParticipantFailed {
                participant: from,
                round,
                reason: err.to_string(),
            }),
            // nothing was sent to the participant for this round
            _ if self.participants.contains_key(&from) => {
                Err(TransportError::ParticipantFailed {
                    participant: from,
                    round,
                    reason: "no global model was distributed for this round".to_string(),
                })
            }
            _ => Err(TransportError::UnknownParticipant(from)),
        }
    }

    async fn shutdown(&mut self, termination: Termination) {
        info!("run {}: releasing {} local participants", termination, self.participants.len());
        self.outbox.clear();
    }
}
