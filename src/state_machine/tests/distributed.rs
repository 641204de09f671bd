use std::time::Duration;

use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

use crate::{
    common::{Rank, RunContext},
    coordinator::{AggregationError, Coordinator},
    message::{Frame, Termination},
    model::tests::vector,
    participant::{Participant, Trainer},
    state_machine::{
        phases::{PhaseError, PhaseName},
        tests::utils::{enable_logging, federation_settings, id, init, participant, stepping},
        StateMachineInitializer,
    },
    transport::{
        LocalGroup,
        MessageTransport,
        ProcessGroup,
        RankMap,
        RemoteParticipant,
        Transport,
        TransportError,
        Uplink,
    },
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_FRAME_LENGTH: usize = 1 << 20;

type Served = JoinHandle<(Result<Termination, TransportError>, u64)>;

/// Runs a participant on its own task, returning its termination and its final round counter.
fn serve<T>(participant: Participant, trainer: T, uplink: Uplink) -> Served
where
    T: Trainer + Send + 'static,
{
    tokio::spawn(async move {
        let mut remote = RemoteParticipant::new(participant, trainer, uplink);
        let termination = remote.run().await;
        (termination, remote.participant().round())
    })
}

fn message_transport(group: ProcessGroup, receive_timeout: Duration) -> MessageTransport {
    MessageTransport::new(group, receive_timeout)
}

#[tokio::test]
async fn test_rounds_over_local_links() {
    enable_logging();
    let participants = vec![participant(1, 10), participant(2, 30)];
    let (group, mut uplinks) = LocalGroup::new(&participants)
        .unwrap()
        .establish(CONNECT_TIMEOUT)
        .await
        .unwrap();
    let sample_counts = group.sample_counts();
    assert_eq!(sample_counts, vec![(id(1), 10), (id(2), 30)]);

    let second = serve(participants[1].clone(), stepping(3.0), uplinks.remove(1));
    let first = serve(participants[0].clone(), stepping(1.0), uplinks.remove(0));

    let transport = message_transport(group, Duration::from_secs(5));
    let (state_machine, _events) = init(
        federation_settings(2, 1),
        transport,
        sample_counts,
        RunContext::default(),
    );
    let state = state_machine.run().await.unwrap();
    // 0.25 * 1 + 0.75 * 3 per round
    assert_eq!(state.params, vector(&[5.0]));
    assert_eq!(state.round, 2);

    for served in vec![first, second] {
        let (termination, rounds) = served.await.unwrap();
        assert_eq!(termination.unwrap(), Termination::Completed { rounds: 2 });
        assert_eq!(rounds, 2);
    }
}

#[tokio::test]
async fn test_rounds_over_tcp() {
    enable_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ranks = RankMap::new(vec![(Rank::new(1), id(5)), (Rank::new(2), id(3))]).unwrap();

    let mut served = Vec::new();
    let joining = vec![(1, participant(5, 20), 2.0), (2, participant(3, 20), 4.0)];
    for (rank, joining, step) in joining {
        served.push(tokio::spawn(async move {
            let uplink = Uplink::connect(
                addr,
                Rank::new(rank),
                &joining,
                CONNECT_TIMEOUT,
                MAX_FRAME_LENGTH,
            )
            .await
            .unwrap();
            let mut remote = RemoteParticipant::new(joining, stepping(step), uplink);
            remote.run().await
        }));
    }

    let group = ProcessGroup::accept(listener, ranks, CONNECT_TIMEOUT, MAX_FRAME_LENGTH)
        .await
        .unwrap();
    let sample_counts = group.sample_counts();
    let transport = message_transport(group, Duration::from_secs(5));
    assert_eq!(transport.cohort(), vec![id(3), id(5)]);

    let (state_machine, _events) = init(
        federation_settings(3, 1),
        transport,
        sample_counts,
        RunContext::default(),
    );
    let state = state_machine.run().await.unwrap();
    assert_eq!(state.params, vector(&[9.0]));

    for served in served {
        assert_eq!(
            served.await.unwrap().unwrap(),
            Termination::Completed { rounds: 3 }
        );
    }
}

#[tokio::test]
async fn test_missing_participant_fails_the_round() {
    enable_logging();
    let participants = vec![participant(1, 10), participant(2, 10)];
    let (group, mut uplinks) = LocalGroup::new(&participants)
        .unwrap()
        .establish(CONNECT_TIMEOUT)
        .await
        .unwrap();
    let sample_counts = group.sample_counts();
    // participant 2 joins but never answers
    let mut silent = uplinks.remove(1);
    let first = serve(participants[0].clone(), stepping(1.0), uplinks.remove(0));

    let transport = message_transport(group, Duration::from_millis(50));
    let (state_machine, events) = init(
        federation_settings(3, 1),
        transport,
        sample_counts,
        RunContext::default(),
    );
    let failure = state_machine.run().await.unwrap_err();
    assert_eq!(failure.error.round, 0);
    assert_eq!(failure.error.phase, PhaseName::Aggregating);
    assert_eq!(failure.error.participant, Some(id(2)));
    match failure.error.source {
        PhaseError::Aggregate(AggregationError::IncompleteCohort {
            expected,
            received,
            missing,
        }) => {
            assert_eq!((expected, received), (2, 1));
            assert_eq!(missing, vec![id(2)]);
        }
        other => panic!("unexpected error {:?}", other),
    }
    // the previous global model is kept
    assert_eq!(failure.last_committed.round, 0);
    assert_eq!(failure.last_committed.params, vector(&[0.0]));
    assert_eq!(events.phase_listener().get_latest().event, PhaseName::Done);

    let (termination, _) = first.await.unwrap();
    assert!(matches!(termination, Ok(Termination::Aborted { .. })));
    assert!(matches!(silent.link_mut().recv().await, Ok(Frame::Global(_))));
    assert!(matches!(
        silent.link_mut().recv().await,
        Ok(Frame::Terminate(Termination::Aborted { .. }))
    ));
}

#[tokio::test]
async fn test_run_deadline_terminates_the_participants() {
    enable_logging();
    let participants = vec![participant(1, 10), participant(2, 10)];
    let (group, mut uplinks) = LocalGroup::new(&participants)
        .unwrap()
        .establish(CONNECT_TIMEOUT)
        .await
        .unwrap();
    let sample_counts = group.sample_counts();
    let mut stuck = uplinks.remove(1);
    let first = serve(participants[0].clone(), stepping(1.0), uplinks.remove(0));

    let transport = message_transport(group, Duration::from_secs(60));
    let context = RunContext::default().with_deadline(Duration::from_millis(100));
    let (state_machine, _events) = init(
        federation_settings(1, 1),
        transport,
        sample_counts,
        context,
    );
    let failure = state_machine.run().await.unwrap_err();
    assert_eq!(failure.error.phase, PhaseName::Collecting);
    assert!(matches!(failure.error.source, PhaseError::RunDeadline));
    assert_eq!(failure.last_committed.round, 0);

    let (termination, rounds) = first.await.unwrap();
    assert!(matches!(
        termination,
        Ok(Termination::Aborted { reason }) if reason.contains("deadline")
    ));
    // trained, but its update was never aggregated
    assert_eq!(rounds, 1);
    assert!(matches!(stuck.link_mut().recv().await, Ok(Frame::Global(_))));
    assert!(matches!(
        stuck.link_mut().recv().await,
        Ok(Frame::Terminate(Termination::Aborted { .. }))
    ));
}

#[tokio::test]
async fn test_interrupt_terminates_the_participants() {
    enable_logging();
    let participants = vec![participant(1, 10), participant(2, 10)];
    let (group, mut uplinks) = LocalGroup::new(&participants)
        .unwrap()
        .establish(CONNECT_TIMEOUT)
        .await
        .unwrap();
    let sample_counts = group.sample_counts();
    let mut stuck = uplinks.remove(1);
    let first = serve(participants[0].clone(), stepping(1.0), uplinks.remove(0));

    let transport = message_transport(group, Duration::from_secs(60));
    let coordinator = Coordinator::initialize(vector(&[0.0]), sample_counts).unwrap();
    let (interrupt_tx, interrupt_rx) = watch::channel(false);
    let (state_machine, _events) = StateMachineInitializer::new(
        federation_settings(1, 1),
        coordinator,
        transport,
        RunContext::default(),
    )
    .with_interrupt(interrupt_rx)
    .init()
    .unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        interrupt_tx.send(true).unwrap();
    });

    let failure = state_machine.run().await.unwrap_err();
    assert_eq!(failure.error.phase, PhaseName::Collecting);
    assert!(matches!(failure.error.source, PhaseError::Interrupted));
    assert_eq!(failure.last_committed.round, 0);

    let (termination, _) = first.await.unwrap();
    assert!(matches!(
        termination,
        Ok(Termination::Aborted { reason }) if reason.contains("interrupted")
    ));
    assert!(matches!(stuck.link_mut().recv().await, Ok(Frame::Global(_))));
    assert!(matches!(
        stuck.link_mut().recv().await,
        Ok(Frame::Terminate(Termination::Aborted { .. }))
    ));
}
