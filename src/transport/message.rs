use std::{collections::BTreeSet, time::Duration};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    common::{ParticipantId, Rank},
    message::{Frame, GlobalMessage, RoundMessage, Termination},
    transport::{
        group::{Link, LinkError, ProcessGroup},
        Transport,
        TransportError,
    },
};

/// The coordinator side of the distributed mode.
///
/// Every participant is reached over the link of its rank. Messages from one rank arrive in the
/// order they were sent; the coordinator waits for a specific rank instead of taking whatever
/// arrives first.
#[derive(Debug)]
pub struct MessageTransport {
    group: ProcessGroup,
    receive_timeout: Duration,
}

impl MessageTransport {
    /// Creates a transport over an established process group.
    pub fn new(group: ProcessGroup, receive_timeout: Duration) -> Self {
        Self {
            group,
            receive_timeout,
        }
    }

    fn link(&mut self, participant: ParticipantId) -> Result<(Rank, &mut Link), TransportError> {
        let rank = self
            .group
            .ranks()
            .rank_of(participant)
            .ok_or(TransportError::UnknownParticipant(participant))?;
        let link = self
            .group
            .link_mut(rank)
            .ok_or(TransportError::RankUnreachable { rank, participant })?;
        Ok((rank, link))
    }
}

fn link_error(err: LinkError, rank: Rank, participant: ParticipantId) -> TransportError {
    match err {
        LinkError::Closed => TransportError::RankUnreachable { rank, participant },
        LinkError::Codec(err) => TransportError::Codec(err),
    }
}

#[async_trait]
impl Transport for MessageTransport {
    fn cohort(&self) -> Vec<ParticipantId> {
        // ranks need not follow the order of the ids
        let cohort: BTreeSet<_> = self.group.ranks().participants().map(|(_, id)| id).collect();
        cohort.into_iter().collect()
    }

    async fn send(&mut self, to: ParticipantId, msg: GlobalMessage) -> Result<(), TransportError> {
        let (rank, link) = self.link(to)?;
        debug!("sending global model of round {} to rank {}", msg.round, rank);
        link.send(&Frame::Global(msg))
            .map_err(|err| link_error(err, rank, to))
    }

    async fn receive(
        &mut self,
        from: ParticipantId,
        round: u64,
    ) -> Result<RoundMessage, TransportError> {
        let after = self.receive_timeout;
        let (rank, link) = self.link(from)?;
        let deadline = tokio::time::Instant::now() + after;
        loop {
            let frame = tokio::time::timeout_at(deadline, link.recv())
                .await
                .map_err(|_| TransportError::Timeout {
                    participant: from,
                    after,
                })?
                .map_err(|err| link_error(err, rank, from))?;

            match frame {
                Frame::Update(msg) if msg.sender != from => {
                    return Err(TransportError::UnexpectedSender {
                        expected: from,
                        found: msg.sender,
                    });
                }
                Frame::Update(msg) if msg.round < round => {
                    debug!("discarding stale update of round {} from rank {}", msg.round, rank);
                }
                Frame::Update(msg) => {
                    debug!("received update of round {} from rank {}", msg.round, rank);
                    return Ok(msg);
                }
                Frame::Failure {
                    participant,
                    round: failed,
                    reason,
                } if participant == from && failed >= round => {
                    return Err(TransportError::ParticipantFailed {
                        participant,
                        round: failed,
                        reason,
                    });
                }
                other => warn!("discarding unexpected {} frame from rank {}", other.kind(), rank),
            }
        }
    }

    async fn shutdown(&mut self, termination: Termination) {
        info!("terminating all participants: {}", termination);
        for (rank, link) in self.group.links_mut() {
            if link.send(&Frame::Terminate(termination.clone())).is_err() {
                debug!("rank {} is gone already", rank);
            }
            link.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::tests::vector,
        participant::Participant,
        transport::group::{LocalGroup, Uplink},
    };

    fn id(id: u64) -> ParticipantId {
        ParticipantId::new(id)
    }

    async fn transport(receive_timeout: Duration) -> (MessageTransport, Vec<Uplink>) {
        let participants = vec![
            Participant::new(id(1), vector(&[0.0]), 10),
            Participant::new(id(2), vector(&[0.0]), 20),
        ];
        let (group, uplinks) = LocalGroup::new(&participants)
            .unwrap()
            .establish(Duration::from_secs(1))
            .await
            .unwrap();
        (MessageTransport::new(group, receive_timeout), uplinks)
    }

    fn update(sender: u64, round: u64, value: f64) -> Frame {
        Frame::Update(RoundMessage {
            sender: id(sender),
            round,
            sample_count: sender * 10,
            params: vector(&[value]),
        })
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (mut transport, mut uplinks) = transport(Duration::from_secs(1)).await;
        assert_eq!(transport.cohort(), vec![id(1), id(2)]);

        let global = GlobalMessage {
            round: 0,
            epochs: 1,
            params: vector(&[1.0]),
        };
        transport.send(id(2), global.clone()).await.unwrap();
        assert_eq!(
            uplinks[1].link_mut().recv().await.unwrap(),
            Frame::Global(global)
        );

        uplinks[1].link_mut().send(&update(2, 0, 4.0)).unwrap();
        uplinks[0].link_mut().send(&update(1, 0, 2.0)).unwrap();
        // addressed by sender, not by arrival
        assert_eq!(transport.receive(id(1), 0).await.unwrap().params, vector(&[2.0]));
        assert_eq!(transport.receive(id(2), 0).await.unwrap().params, vector(&[4.0]));
    }

    #[tokio::test]
    async fn test_cohort_is_ordered_by_id() {
        let participants = vec![
            Participant::new(id(7), vector(&[0.0]), 10),
            Participant::new(id(2), vector(&[0.0]), 10),
            Participant::new(id(4), vector(&[0.0]), 10),
        ];
        let (group, _uplinks) = LocalGroup::new(&participants)
            .unwrap()
            .establish(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(group.ranks().rank_of(id(7)), Some(Rank::new(1)));
        let transport = MessageTransport::new(group, Duration::from_secs(1));
        assert_eq!(transport.cohort(), vec![id(2), id(4), id(7)]);
    }

    #[tokio::test]
    async fn test_stale_updates_are_discarded() {
        let (mut transport, mut uplinks) = transport(Duration::from_secs(1)).await;
        let link = uplinks[0].link_mut();
        link.send(&update(1, 0, 1.0)).unwrap();
        link.send(&update(1, 1, 2.0)).unwrap();
        let msg = transport.receive(id(1), 1).await.unwrap();
        assert_eq!(msg.round, 1);
        assert_eq!(msg.params, vector(&[2.0]));
    }

    #[tokio::test]
    async fn test_receive_errors() {
        let (mut transport, mut uplinks) = transport(Duration::from_millis(50)).await;

        assert!(matches!(
            transport.receive(id(1), 0).await,
            Err(TransportError::Timeout { participant, .. }) if participant == id(1)
        ));

        uplinks[0].link_mut().send(&update(2, 0, 1.0)).unwrap();
        assert!(matches!(
            transport.receive(id(1), 0).await,
            Err(TransportError::UnexpectedSender { expected, found })
                if expected == id(1) && found == id(2)
        ));

        uplinks[0]
            .link_mut()
            .send(&Frame::Failure {
                participant: id(1),
                round: 0,
                reason: "diverged".to_string(),
            })
            .unwrap();
        assert!(matches!(
            transport.receive(id(1), 0).await,
            Err(TransportError::ParticipantFailed { reason, .. }) if reason == "diverged"
        ));

        uplinks[1].link_mut().close().await;
        drop(uplinks);
        assert!(matches!(
            transport.receive(id(2), 0).await,
            Err(TransportError::RankUnreachable { rank, .. }) if rank == Rank::new(2)
        ));
        assert!(matches!(
            transport.receive(id(9), 0).await,
            Err(TransportError::UnknownParticipant(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_participants() {
        let (mut transport, mut uplinks) = transport(Duration::from_secs(1)).await;
        let termination = Termination::Aborted {
            reason: "run deadline elapsed".to_string(),
        };
        transport.shutdown(termination.clone()).await;
        for uplink in uplinks.iter_mut() {
            assert_eq!(
                uplink.link_mut().recv().await.unwrap(),
                Frame::Terminate(termination.clone())
            );
            assert!(matches!(uplink.link_mut().recv().await, Err(LinkError::Closed)));
        }
        let global = GlobalMessage {
            round: 0,
            epochs: 1,
            params: vector(&[0.0]),
        };
        assert!(matches!(
            transport.send(id(1), global).await,
            Err(TransportError::RankUnreachable { .. })
        ));
    }
}
