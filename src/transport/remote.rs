use std::time::Duration;

use tracing::{debug, error_span, info, warn};
use tracing_futures::Instrument;

use crate::{
    common::Rank,
    message::{Frame, GlobalMessage, RoundMessage, Termination},
    participant::{LocalUpdateError, Participant, Trainer},
    transport::{
        group::{LinkError, Uplink},
        TransportError,
    },
};

/// The participant side of the distributed mode.
///
/// Answers every global model received over the uplink with the participant's local update until
/// the coordinator terminates the run. A participant whose uplink closes stops as well.
pub struct RemoteParticipant<T> {
    participant: Participant,
    trainer: T,
    uplink: Uplink,
    idle_timeout: Option<Duration>,
}

impl<T> RemoteParticipant<T>
where
    T: Trainer + Send,
{
    pub fn new(participant: Participant, trainer: T, uplink: Uplink) -> Self {
        Self {
            participant,
            trainer,
            uplink,
            idle_timeout: None,
        }
    }

    /// Stops waiting for the coordinator after `idle_timeout` without any frame.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Serves the coordinator until the run is terminated.
    ///
    /// # Errors
    /// Fails if the uplink closes or stays idle for too long, or if the coordinator sends a frame
    /// that can't be decoded.
    pub async fn run(&mut self) -> Result<Termination, TransportError> {
        let id = self.participant.id();
        let span = error_span!("participant", id = %id);

        async move {
            info!("waiting for the coordinator");
            loop {
                match self.next_frame().await? {
                    Frame::Global(msg) => {
                        let answer = self.answer(msg);
                        self.uplink
                            .link_mut()
                            .send(&answer)
                            .map_err(|err| self.link_error(err))?;
                    }
                    Frame::Terminate(termination) => {
                        info!("run {}", termination);
                        self.uplink.link_mut().close().await;
                        break Ok(termination);
                    }
                    other => warn!("ignoring unexpected {} frame", other.kind()),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        let participant = self.participant.id();
        let recv = self.uplink.link_mut().recv();
        let frame = match self.idle_timeout {
            Some(after) => tokio::time::timeout(after, recv)
                .await
                .map_err(|_| TransportError::Timeout { participant, after })?,
            None => recv.await,
        };
        frame.map_err(|err| self.link_error(err))
    }

    /// Runs the local update for a global model and builds the frame to answer with.
    fn answer(&mut self, msg: GlobalMessage) -> Frame {
        let GlobalMessage {
            round,
            epochs,
            params,
        } = msg;
        debug!("received global model of round {}", round);
        let participant = &mut self.participant;
        let trainer = &mut self.trainer;
        let outcome = participant
            .set_parameters(params)
            .map_err(|source| LocalUpdateError::Shape { epoch: 0, source })
            .and_then(|_| participant.local_update(trainer, epochs));
        match outcome {
            Ok((params, sample_count)) => Frame::Update(RoundMessage {
                sender: participant.id(),
                round,
                sample_count,
                params,
            }),
            Err(err) => {
                warn!("local update of round {} failed: {}", round, err);
                Frame::Failure {
                    participant: participant.id(),
                    round,
                    reason: err.to_string(),
                }
            }
        }
    }

    fn link_error(&self, err: LinkError) -> TransportError {
        match err {
            LinkError::Closed => TransportError::RankUnreachable {
                rank: Rank::COORDINATOR,
                participant: self.participant.id(),
            },
            LinkError::Codec(err) => TransportError::Codec(err),
        }
    }
}
