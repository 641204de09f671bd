use std::path::PathBuf;

use anyhow::{anyhow, Context};
use structopt::StructOpt;
use tracing::{error_span, info, warn};
use tracing_futures::Instrument;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fedavg::{
    common::{ParticipantId, Rank, RunContext},
    coordinator::{Coordinator, GlobalState},
    model::ParameterSet,
    participant::Participant,
    settings::{FederationSettings, Settings},
    state_machine::StateMachineInitializer,
    transport::{
        DirectTransport,
        LocalGroup,
        MessageTransport,
        ProcessGroup,
        RemoteParticipant,
        Transport,
        Uplink,
    },
};

mod trainer;

use trainer::SyntheticTrainer;

const LEARNING_RATE: f64 = 0.1;

#[derive(Debug, StructOpt)]
#[structopt(name = "test-drive")]
enum Opt {
    /// Runs the same federation co-located and over in-memory links, and compares the results.
    Local {
        /// Path of the configuration file
        #[structopt(short, parse(from_os_str))]
        config_path: PathBuf,
        /// Number of participants
        #[structopt(short, long, default_value = "4")]
        participants: u64,
    },
    /// Runs the coordinator of the distributed mode.
    Coordinator {
        /// Path of the configuration file
        #[structopt(short, parse(from_os_str))]
        config_path: PathBuf,
    },
    /// Runs one participant of the distributed mode.
    Participant {
        /// Path of the configuration file
        #[structopt(short, parse(from_os_str))]
        config_path: PathBuf,
        /// The rank of the participant in the process group
        #[structopt(short, long)]
        rank: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .init();

    match Opt::from_args() {
        Opt::Local {
            config_path,
            participants,
        } => local(Settings::new(config_path)?, participants).await,
        Opt::Coordinator { config_path } => coordinator(Settings::new(config_path)?).await,
        Opt::Participant { config_path, rank } => {
            participant(Settings::new(config_path)?, Rank::new(rank)).await
        }
    }
}

/// Every participant holds a hundred samples per unit of its id.
fn new_participant(id: ParticipantId, model: &ParameterSet) -> Participant {
    Participant::new(id, model.clone(), 100 * u64::from(id))
}

fn run_context(settings: &FederationSettings) -> RunContext {
    let context = RunContext::new(settings.device);
    match settings.run_deadline() {
        Some(deadline) => context.with_deadline(deadline),
        None => context,
    }
}

async fn run<T>(
    settings: FederationSettings,
    initial: ParameterSet,
    sample_counts: Vec<(ParticipantId, u64)>,
    transport: T,
) -> anyhow::Result<GlobalState>
where
    T: Transport,
{
    let coordinator = Coordinator::initialize(initial, sample_counts)?;
    let (state_machine, _events) =
        StateMachineInitializer::new(settings, coordinator, transport, run_context(&settings))
            .init()?;
    Ok(state_machine.run().await?)
}

async fn local(settings: Settings, participants: u64) -> anyhow::Result<()> {
    let initial = settings.model.initial_params()?;
    let participants: Vec<_> = (1..=participants)
        .map(|id| new_participant(ParticipantId::new(id), &initial))
        .collect();

    let mut direct = DirectTransport::new().on_device(settings.federation.device);
    for participant in participants.iter() {
        let trainer = SyntheticTrainer::new(participant.id(), &initial, LEARNING_RATE)?;
        direct = direct.with_participant(participant.clone(), trainer);
    }
    let sample_counts = direct.sample_counts();
    let co_located = run(
        settings.federation,
        initial.clone(),
        sample_counts,
        direct,
    )
    .instrument(error_span!("co-located"))
    .await?;

    let (group, uplinks) = LocalGroup::new(&participants)?
        .establish(settings.group.connect_timeout())
        .await?;
    for (participant, uplink) in participants.into_iter().zip(uplinks) {
        let trainer = SyntheticTrainer::new(participant.id(), &initial, LEARNING_RATE)?;
        let participant = participant.with_device(settings.federation.device);
        let mut remote = RemoteParticipant::new(participant, trainer, uplink);
        tokio::spawn(async move {
            if let Err(err) = remote.run().await {
                warn!("participant stopped: {}", err);
            }
        });
    }
    let sample_counts = group.sample_counts();
    let transport = MessageTransport::new(group, settings.group.receive_timeout());
    let distributed = run(settings.federation, initial, sample_counts, transport)
        .instrument(error_span!("distributed"))
        .await?;

    if co_located.params == distributed.params {
        info!(
            "both modes agree after {} rounds: {:?}",
            co_located.round, co_located.params
        );
        Ok(())
    } else {
        Err(anyhow!(
            "the modes disagree: {:?} co-located, {:?} distributed",
            co_located.params,
            distributed.params
        ))
    }
}

async fn coordinator(settings: Settings) -> anyhow::Result<()> {
    let initial = settings.model.initial_params()?;
    let group = ProcessGroup::bind(&settings.group).await?;
    let sample_counts = group.sample_counts();
    let transport = MessageTransport::new(group, settings.group.receive_timeout());
    let global = run(settings.federation, initial, sample_counts, transport).await?;
    info!("global model after {} rounds: {:?}", global.round, global.params);
    Ok(())
}

async fn participant(settings: Settings, rank: Rank) -> anyhow::Result<()> {
    let id = settings
        .group
        .rank_map()?
        .participants()
        .find(|(r, _)| *r == rank)
        .map(|(_, id)| id)
        .ok_or_else(|| anyhow!("no participant configured for rank {}", rank))?;
    let initial = settings.model.initial_params()?;
    let participant = new_participant(id, &initial).with_device(settings.federation.device);
    let trainer = SyntheticTrainer::new(id, &initial, LEARNING_RATE)?;

    let uplink = Uplink::connect(
        settings.group.coordinator_address,
        rank,
        &participant,
        settings.group.connect_timeout(),
        settings.group.max_frame_length,
    )
    .await
    .context("failed to join the process group")?;
    let termination = RemoteParticipant::new(participant, trainer, uplink)
        .with_idle_timeout(settings.group.receive_timeout() + settings.federation.collect_timeout())
        .run()
        .await?;
    info!("run {}", termination);
    Ok(())
}
