use std::{path::PathBuf, process};

use anyhow::Context;
use structopt::StructOpt;
use tokio::{signal, sync::watch};
use tracing::{info, warn};
use tracing_subscriber::*;

use fedavg::{
    common::RunContext,
    coordinator::Coordinator,
    settings::Settings,
    state_machine::StateMachineInitializer,
    transport::{MessageTransport, ProcessGroup},
};

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        federation: federation_settings,
        group: group_settings,
        model: model_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let initial = model_settings
        .initial_params()
        .context("invalid model settings")?;
    let group = ProcessGroup::bind(&group_settings)
        .await
        .context("failed to establish the process group")?;
    let coordinator = Coordinator::initialize(initial, group.sample_counts())
        .context("failed to initialize the coordinator")?;
    let transport = MessageTransport::new(group, group_settings.receive_timeout());

    let mut context = RunContext::new(federation_settings.device);
    if let Some(deadline) = federation_settings.run_deadline() {
        context = context.with_deadline(deadline);
    }
    info!("run id: {}", context.run_id);

    let (interrupt_tx, interrupt_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupted: aborting the run");
            let _ = interrupt_tx.send(true);
        }
    });

    let (state_machine, _event_subscriber) =
        StateMachineInitializer::new(federation_settings, coordinator, transport, context)
            .with_hook(|committed| {
                info!(
                    "round {} committed: {} parameters over {} participants",
                    committed.round,
                    committed.params.num_parameters(),
                    committed.coordinator.cohort_size(),
                );
            })
            .with_interrupt(interrupt_rx)
            .init()
            .context("failed to initialize the state machine")?;

    // an interrupted run still terminates the participants before returning
    let global = state_machine.run().await?;
    info!(
        "final global model after {} rounds: {} parameters",
        global.round,
        global.params.num_parameters()
    );
    Ok(())
}
