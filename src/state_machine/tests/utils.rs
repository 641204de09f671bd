use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tracing_subscriber::*;

use crate::{
    common::{Device, ParticipantId, RunContext},
    coordinator::Coordinator,
    model::{tests::vector, ParameterSet},
    participant::{Participant, TrainError, TrainingContext},
    settings::FederationSettings,
    state_machine::{events::EventSubscriber, StateMachine, StateMachineInitializer},
    transport::Transport,
};

pub type Trained = Result<ParameterSet, TrainError>;

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

pub fn federation_settings(num_rounds: u64, epochs: u32) -> FederationSettings {
    FederationSettings {
        num_rounds,
        epochs,
        collect_timeout: 5,
        run_deadline: None,
        device: Device::Cpu,
    }
}

pub fn id(id: u64) -> ParticipantId {
    ParticipantId::new(id)
}

/// A participant whose local model starts at `[0.0]`.
pub fn participant(p: u64, sample_count: u64) -> Participant {
    Participant::new(id(p), vector(&[0.0]), sample_count)
}

/// A trainer which always ends up with the same parameters.
pub fn constant(value: f64) -> impl FnMut(&ParameterSet, &TrainingContext) -> Trained + Send {
    move |_: &ParameterSet, _: &TrainingContext| -> Trained { Ok(vector(&[value])) }
}

/// A trainer which moves every parameter by `step` per pass.
pub fn stepping(step: f64) -> impl FnMut(&ParameterSet, &TrainingContext) -> Trained + Send {
    move |params: &ParameterSet, _: &TrainingContext| -> Trained {
        let mut trained = params.clone();
        trained
            .scaled_add(1.0, &vector(&[step]))
            .map_err(TrainError::new)?;
        Ok(trained)
    }
}

/// A trainer which counts its passes.
pub fn counting(
    passes: Arc<AtomicUsize>,
) -> impl FnMut(&ParameterSet, &TrainingContext) -> Trained + Send {
    move |params: &ParameterSet, _: &TrainingContext| -> Trained {
        passes.fetch_add(1, Ordering::SeqCst);
        Ok(params.clone())
    }
}

/// A trainer which fails from the given round on.
pub fn failing_from(
    round: u64,
) -> impl FnMut(&ParameterSet, &TrainingContext) -> Trained + Send {
    move |params: &ParameterSet, ctx: &TrainingContext| -> Trained {
        if ctx.round >= round {
            Err(TrainError::new("out of memory"))
        } else {
            Ok(params.clone())
        }
    }
}

/// Initializes a state machine over `transport`, starting from `[0.0]` with the given cohort.
pub fn init<T>(
    settings: FederationSettings,
    transport: T,
    sample_counts: Vec<(ParticipantId, u64)>,
    context: RunContext,
) -> (StateMachine<T>, EventSubscriber)
where
    T: Transport,
{
    let coordinator = Coordinator::initialize(vector(&[0.0]), sample_counts).unwrap();
    StateMachineInitializer::new(settings, coordinator, transport, context)
        .init()
        .unwrap()
}
