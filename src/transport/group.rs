//! A fixed-size process group with the coordinator at rank `0`.
//!
//! The group is established before a distributed run starts and never changes afterwards:
//!
//! 1. The [`RankMap`] assigns a participant to every rank `1..world_size`.
//! 2. Every participant opens an [`Uplink`] to the coordinator and announces itself with a
//!    [`Frame::Join`] carrying its rank, its identifier and its sample count.
//! 3. The coordinator accepts joins until every rank is present. Joins that disagree with the
//!    rank map are dropped. The sample counts of the joins make up the cohort registry.
//!
//! A [`Link`] is a bidirectional channel of encoded frames. TCP links frame the bytes with a
//! length prefix; in-memory links ([`LocalGroup`]) pass the encoded bytes through channels, so
//! both take the same encoding path.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    time::Duration,
};

use bytes::Bytes;
use displaydoc::Display;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, timeout_at, Instant},
};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::{
    common::{ParticipantId, Rank},
    message::Frame,
    participant::Participant,
    settings::GroupSettings,
};

/// The pause between two connection attempts of an [`Uplink`].
const RETRY_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
/// Errors which can occur while establishing a process group.
pub enum GroupError {
    #[error("the process group has no participants")]
    EmptyGroup,
    #[error("rank 0 is reserved for the coordinator, found participant {0}")]
    CoordinatorRank(ParticipantId),
    #[error("rank {0} is assigned more than once")]
    DuplicateRank(Rank),
    #[error("participant {0} is assigned more than one rank")]
    DuplicateParticipant(ParticipantId),
    #[error("ranks must be contiguous, rank {0} is missing")]
    MissingRank(Rank),
    #[error("ranks {missing:?} didn't join within {after:?}")]
    ConnectTimeout { missing: Vec<Rank>, after: Duration },
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Display, Error)]
/// Errors which can occur when using a [`Link`].
pub enum LinkError {
    /// the link is closed
    Closed,
    /// invalid frame: {0}
    Codec(#[from] bincode::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The role of a rank.
pub enum Role {
    Coordinator,
    Participant(ParticipantId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The fixed assignment of participants to ranks.
pub struct RankMap {
    participants: BTreeMap<Rank, ParticipantId>,
}

impl RankMap {
    /// Creates a rank map from the participant ranks.
    ///
    /// # Errors
    /// Fails unless the ranks are exactly `1..=n` and every participant appears once.
    pub fn new<I>(ranks: I) -> Result<Self, GroupError>
    where
        I: IntoIterator<Item = (Rank, ParticipantId)>,
    {
        let mut participants = BTreeMap::new();
        let mut seen = BTreeSet::new();
        for (rank, participant) in ranks {
            if rank == Rank::COORDINATOR {
                return Err(GroupError::CoordinatorRank(participant));
            }
            if !seen.insert(participant) {
                return Err(GroupError::DuplicateParticipant(participant));
            }
            if participants.insert(rank, participant).is_some() {
                return Err(GroupError::DuplicateRank(rank));
            }
        }
        if participants.is_empty() {
            return Err(GroupError::EmptyGroup);
        }
        if let Some(missing) = (1..=participants.len() as u32)
            .map(Rank::new)
            .find(|rank| !participants.contains_key(rank))
        {
            return Err(GroupError::MissingRank(missing));
        }
        Ok(Self { participants })
    }

    /// Assigns ranks `1..=n` to the participants, in the given order.
    pub fn sequential<I>(participants: I) -> Result<Self, GroupError>
    where
        I: IntoIterator<Item = ParticipantId>,
    {
        Self::new(
            participants
                .into_iter()
                .zip(1..)
                .map(|(participant, rank)| (Rank::new(rank), participant)),
        )
    }

    /// The number of ranks, the coordinator included.
    pub fn world_size(&self) -> u32 {
        self.participants.len() as u32 + 1
    }

    pub fn role(&self, rank: Rank) -> Option<Role> {
        if rank == Rank::COORDINATOR {
            Some(Role::Coordinator)
        } else {
            self.participants.get(&rank).copied().map(Role::Participant)
        }
    }

    pub fn rank_of(&self, participant: ParticipantId) -> Option<Rank> {
        self.participants
            .iter()
            .find(|(_, id)| **id == participant)
            .map(|(rank, _)| *rank)
    }

    /// The participant ranks, in ascending order.
    pub fn participants(&self) -> impl Iterator<Item = (Rank, ParticipantId)> + '_ {
        self.participants.iter().map(|(rank, id)| (*rank, *id))
    }
}

/// A bidirectional channel of [`Frame`]s to another rank.
#[derive(Debug)]
pub struct Link {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    writer: Option<JoinHandle<()>>,
}

impl Link {
    /// Creates two connected in-memory links.
    pub fn pair() -> (Link, Link) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();
        let left = Link {
            tx: Some(left_tx),
            rx: left_rx,
            writer: None,
        };
        let right = Link {
            tx: Some(right_tx),
            rx: right_rx,
            writer: None,
        };
        (left, right)
    }

    /// Creates a link over a TCP stream with length-prefixed frames.
    ///
    /// Frames longer than `max_frame_length` bytes are rejected by the reading side, which then
    /// closes the link.
    pub fn tcp(stream: TcpStream, max_frame_length: usize) -> Link {
        let (read, write) = stream.into_split();
        let mut codec = LengthDelimitedCodec::builder();
        codec.max_frame_length(max_frame_length);
        let mut reader = FramedRead::new(read, codec.new_codec());
        let mut writer = FramedWrite::new(write, codec.new_codec());

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(bytes) => {
                        if in_tx.send(bytes.freeze()).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("failed to read frame: {}", err);
                        break;
                    }
                }
            }
        });

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
        let writer = tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if let Err(err) = writer.send(bytes).await {
                    warn!("failed to write frame: {}", err);
                    break;
                }
            }
            let _ = writer.close().await;
        });

        Link {
            tx: Some(out_tx),
            rx: in_rx,
            writer: Some(writer),
        }
    }

    /// Queues a frame for the other rank.
    pub fn send(&self, frame: &Frame) -> Result<(), LinkError> {
        let bytes = frame.encode()?;
        self.tx
            .as_ref()
            .ok_or(LinkError::Closed)?
            .send(bytes)
            .map_err(|_| LinkError::Closed)
    }

    /// Waits for the next frame of the other rank.
    pub async fn recv(&mut self) -> Result<Frame, LinkError> {
        let bytes = self.rx.recv().await.ok_or(LinkError::Closed)?;
        Ok(Frame::decode(&bytes)?)
    }

    /// Closes the sending half and waits until the queued frames are written.
    pub async fn close(&mut self) {
        self.tx.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
    }
}

/// The coordinator side of an established process group.
#[derive(Debug)]
pub struct ProcessGroup {
    ranks: RankMap,
    links: BTreeMap<Rank, Link>,
    sample_counts: BTreeMap<ParticipantId, u64>,
}

impl ProcessGroup {
    /// Listens on the coordinator address and waits until every participant rank has joined.
    pub async fn bind(settings: &GroupSettings) -> Result<Self, GroupError> {
        let ranks = settings.rank_map()?;
        let listener = TcpListener::bind(settings.coordinator_address).await?;
        info!(
            "waiting for {} participants on {}",
            ranks.world_size() - 1,
            settings.coordinator_address
        );
        Self::accept(
            listener,
            ranks,
            settings.connect_timeout(),
            settings.max_frame_length,
        )
        .await
    }

    /// Accepts TCP connections until every participant rank has joined.
    pub async fn accept(
        listener: TcpListener,
        ranks: RankMap,
        connect_timeout: Duration,
        max_frame_length: usize,
    ) -> Result<Self, GroupError> {
        let deadline = Instant::now() + connect_timeout;
        let mut group = Self::empty(ranks);
        while !group.is_complete() {
            let (stream, addr) = match timeout_at(deadline, listener.accept()).await {
                Ok(accepted) => accepted?,
                Err(_) => return Err(group.timeout(connect_timeout)),
            };
            debug!("accepted connection from {}", addr);
            let link = Link::tcp(stream, max_frame_length);
            if timeout_at(deadline, group.join(link)).await.is_err() {
                return Err(group.timeout(connect_timeout));
            }
        }
        info!("all {} participants joined", group.links.len());
        Ok(group)
    }

    /// Establishes a group over existing links, waiting for the join of every link.
    pub async fn from_links<I>(
        ranks: RankMap,
        links: I,
        connect_timeout: Duration,
    ) -> Result<Self, GroupError>
    where
        I: IntoIterator<Item = Link>,
    {
        let deadline = Instant::now() + connect_timeout;
        let mut group = Self::empty(ranks);
        for link in links {
            if timeout_at(deadline, group.join(link)).await.is_err() {
                return Err(group.timeout(connect_timeout));
            }
        }
        if group.is_complete() {
            Ok(group)
        } else {
            Err(group.timeout(connect_timeout))
        }
    }

    fn empty(ranks: RankMap) -> Self {
        Self {
            ranks,
            links: BTreeMap::new(),
            sample_counts: BTreeMap::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.links.len() as u32 + 1 == self.ranks.world_size()
    }

    fn timeout(&self, after: Duration) -> GroupError {
        let missing = self
            .ranks
            .participants()
            .map(|(rank, _)| rank)
            .filter(|rank| !self.links.contains_key(rank))
            .collect();
        GroupError::ConnectTimeout { missing, after }
    }

    /// Reads the join frame of a link and registers it. Invalid joins are dropped.
    async fn join(&mut self, mut link: Link) {
        let frame = match link.recv().await {
            Ok(frame) => frame,
            Err(err) => {
                warn!("dropping link before join: {}", err);
                return;
            }
        };
        let (rank, participant, sample_count) = match frame {
            Frame::Join {
                rank,
                participant,
                sample_count,
            } => (rank, participant, sample_count),
            other => {
                warn!("dropping link: expected a join frame, found {}", other.kind());
                return;
            }
        };
        if self.ranks.role(rank) != Some(Role::Participant(participant)) {
            warn!(
                "dropping join of participant {} as rank {}: rank map disagrees",
                participant, rank
            );
            return;
        }
        if self.links.contains_key(&rank) {
            warn!("dropping join of participant {}: rank {} joined already", participant, rank);
            return;
        }
        debug!(
            "participant {} joined as rank {} with {} samples",
            participant, rank, sample_count
        );
        self.links.insert(rank, link);
        self.sample_counts.insert(participant, sample_count);
    }

    pub fn ranks(&self) -> &RankMap {
        &self.ranks
    }

    /// The sample counts announced by the participants, for initializing the coordinator.
    pub fn sample_counts(&self) -> Vec<(ParticipantId, u64)> {
        self.sample_counts
            .iter()
            .map(|(id, count)| (*id, *count))
            .collect()
    }

    pub(crate) fn link_mut(&mut self, rank: Rank) -> Option<&mut Link> {
        self.links.get_mut(&rank)
    }

    pub(crate) fn links_mut(&mut self) -> impl Iterator<Item = (&Rank, &mut Link)> {
        self.links.iter_mut()
    }
}

/// The participant side of a process group: a link to the coordinator.
#[derive(Debug)]
pub struct Uplink {
    rank: Rank,
    link: Link,
}

impl Uplink {
    /// Joins the group over an existing link.
    pub fn join(link: Link, rank: Rank, participant: &Participant) -> Result<Self, GroupError> {
        link.send(&Frame::Join {
            rank,
            participant: participant.id(),
            sample_count: participant.sample_count(),
        })?;
        Ok(Self { rank, link })
    }

    /// Connects to the coordinator and joins the group.
    ///
    /// Connection attempts are retried until `connect_timeout` elapses, so participants may be
    /// started before the coordinator.
    pub async fn connect(
        addr: SocketAddr,
        rank: Rank,
        participant: &Participant,
        connect_timeout: Duration,
        max_frame_length: usize,
    ) -> Result<Self, GroupError> {
        let deadline = Instant::now() + connect_timeout;
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(err) if Instant::now() + RETRY_INTERVAL < deadline => {
                    debug!("coordinator at {} not reachable yet: {}", addr, err);
                    sleep(RETRY_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        };
        info!("connected to the coordinator at {}", addr);
        Self::join(Link::tcp(stream, max_frame_length), rank, participant)
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

/// An in-memory process group, for running the distributed mode within one process.
#[derive(Debug)]
pub struct LocalGroup {
    pub ranks: RankMap,
    /// The coordinator side of the links, one per participant rank.
    pub links: Vec<Link>,
    /// The participant side of the links, in rank order.
    pub uplinks: Vec<Uplink>,
}

impl LocalGroup {
    /// Assigns ranks `1..=n` to the participants and joins each of them over an in-memory link.
    pub fn new<'a, I>(participants: I) -> Result<Self, GroupError>
    where
        I: IntoIterator<Item = &'a Participant>,
    {
        let participants: Vec<&Participant> = participants.into_iter().collect();
        let ranks = RankMap::sequential(participants.iter().map(|p| p.id()))?;
        let mut links = Vec::with_capacity(participants.len());
        let mut uplinks = Vec::with_capacity(participants.len());
        for (participant, rank) in participants.into_iter().zip(1..) {
            let (coordinator_side, participant_side) = Link::pair();
            links.push(coordinator_side);
            uplinks.push(Uplink::join(participant_side, Rank::new(rank), participant)?);
        }
        Ok(Self {
            ranks,
            links,
            uplinks,
        })
    }

    /// Completes the join handshake on the coordinator side.
    pub async fn establish(
        self,
        connect_timeout: Duration,
    ) -> Result<(ProcessGroup, Vec<Uplink>), GroupError> {
        let group = ProcessGroup::from_links(self.ranks, self.links, connect_timeout).await?;
        Ok((group, self.uplinks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::Termination, model::tests::vector};

    fn id(id: u64) -> ParticipantId {
        ParticipantId::new(id)
    }

    fn participant(p: u64, samples: u64) -> Participant {
        Participant::new(id(p), vector(&[0.0]), samples)
    }

    #[test]
    fn test_rank_map() {
        let ranks = RankMap::new(vec![(Rank::new(2), id(20)), (Rank::new(1), id(10))]).unwrap();
        assert_eq!(ranks.world_size(), 3);
        assert_eq!(ranks.role(Rank::COORDINATOR), Some(Role::Coordinator));
        assert_eq!(ranks.role(Rank::new(2)), Some(Role::Participant(id(20))));
        assert_eq!(ranks.role(Rank::new(3)), None);
        assert_eq!(ranks.rank_of(id(10)), Some(Rank::new(1)));
        assert_eq!(
            ranks.participants().collect::<Vec<_>>(),
            vec![(Rank::new(1), id(10)), (Rank::new(2), id(20))]
        );
    }

    #[test]
    fn test_invalid_rank_maps() {
        assert!(matches!(
            RankMap::new(Vec::new()),
            Err(GroupError::EmptyGroup)
        ));
        assert!(matches!(
            RankMap::new(vec![(Rank::COORDINATOR, id(1))]),
            Err(GroupError::CoordinatorRank(_))
        ));
        assert!(matches!(
            RankMap::new(vec![(Rank::new(1), id(1)), (Rank::new(1), id(2))]),
            Err(GroupError::DuplicateRank(_))
        ));
        assert!(matches!(
            RankMap::new(vec![(Rank::new(1), id(1)), (Rank::new(2), id(1))]),
            Err(GroupError::DuplicateParticipant(_))
        ));
        assert!(matches!(
            RankMap::new(vec![(Rank::new(1), id(1)), (Rank::new(3), id(3))]),
            Err(GroupError::MissingRank(rank)) if rank == Rank::new(2)
        ));
    }

    #[tokio::test]
    async fn test_link_pair() {
        let (mut left, mut right) = Link::pair();
        let frame = Frame::Terminate(Termination::Completed { rounds: 3 });
        left.send(&frame).unwrap();
        assert_eq!(right.recv().await.unwrap(), frame);

        left.close().await;
        assert!(matches!(right.recv().await, Err(LinkError::Closed)));
        assert!(matches!(left.send(&frame), Err(LinkError::Closed)));
    }

    #[tokio::test]
    async fn test_local_group() {
        let participants = vec![participant(7, 10), participant(3, 30)];
        let local = LocalGroup::new(&participants).unwrap();
        let (group, uplinks) = local.establish(Duration::from_secs(1)).await.unwrap();

        assert_eq!(group.ranks().rank_of(id(7)), Some(Rank::new(1)));
        assert_eq!(group.sample_counts(), vec![(id(3), 30), (id(7), 10)]);
        assert_eq!(
            uplinks.iter().map(Uplink::rank).collect::<Vec<_>>(),
            vec![Rank::new(1), Rank::new(2)]
        );
    }

    #[tokio::test]
    async fn test_join_rejected_by_rank_map() {
        let ranks = RankMap::sequential(vec![id(1), id(2)]).unwrap();
        let (good, good_uplink) = Link::pair();
        let (bad, bad_uplink) = Link::pair();
        let _good = Uplink::join(good_uplink, Rank::new(1), &participant(1, 1)).unwrap();
        // participant 2 claims the wrong rank
        let _bad = Uplink::join(bad_uplink, Rank::new(1), &participant(2, 1)).unwrap();

        let err = ProcessGroup::from_links(ranks, vec![good, bad], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GroupError::ConnectTimeout { missing, .. } if missing == vec![Rank::new(2)]
        ));
    }

    #[tokio::test]
    async fn test_tcp_group() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ranks = RankMap::sequential(vec![id(1), id(2)]).unwrap();

        let participants = tokio::spawn(async move {
            let mut uplinks = Vec::new();
            for (p, rank) in vec![(2, 2), (1, 1)] {
                let uplink = Uplink::connect(
                    addr,
                    Rank::new(rank),
                    &participant(p, p * 100),
                    Duration::from_secs(5),
                    1024,
                )
                .await
                .unwrap();
                uplinks.push(uplink);
            }
            uplinks
        });

        let mut group = ProcessGroup::accept(listener, ranks, Duration::from_secs(5), 1024)
            .await
            .unwrap();
        let mut uplinks = participants.await.unwrap();
        assert_eq!(group.sample_counts(), vec![(id(1), 100), (id(2), 200)]);

        let frame = Frame::Terminate(Termination::Completed { rounds: 0 });
        let link = group.link_mut(Rank::new(1)).unwrap();
        link.send(&frame).unwrap();
        link.close().await;
        let uplink = uplinks
            .iter_mut()
            .find(|uplink| uplink.rank() == Rank::new(1))
            .unwrap();
        assert_eq!(uplink.link_mut().recv().await.unwrap(), frame);
        assert!(matches!(uplink.link_mut().recv().await, Err(LinkError::Closed)));
    }

    #[tokio::test]
    async fn test_tcp_link_rejects_oversized_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();

        let mut receiving = Link::tcp(server, 16);
        let mut sending = Link::tcp(client.await.unwrap(), 1 << 20);
        sending
            .send(&Frame::Global(crate::message::GlobalMessage {
                round: 0,
                epochs: 1,
                params: vector(&[0.0; 64]),
            }))
            .unwrap();
        sending.close().await;
        assert!(matches!(receiving.recv().await, Err(LinkError::Closed)));
    }
}
