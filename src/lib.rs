//! `fedavg` coordinates Federated Averaging (FedAVG) training runs.
//!
//! A set of participants holds private data along with a local copy of a shared model. Every
//! round, the coordinator distributes the global model, each participant trains it locally for a
//! number of epochs, and the coordinator replaces the global model by the average of the local
//! models weighted by the participants' sample counts. The private data never leaves a
//! participant.
//!
//! # Execution modes
//!
//! The rounds are orchestrated by the [`StateMachine`], which talks to the participants through a
//! [`Transport`]:
//!
//! - co-located: the participants live in the coordinator's process and are updated one at a
//!   time by a [`DirectTransport`].
//! - distributed: every participant is a separate rank of a [`ProcessGroup`], running a
//!   [`RemoteParticipant`] on its side; the coordinator uses a [`MessageTransport`].
//!
//! Both modes produce the same global model for the same local updates.
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use fedavg::{
//!     common::{ParticipantId, RunContext},
//!     coordinator::Coordinator,
//!     model::{ParameterSet, Tensor},
//!     participant::{Participant, TrainError, TrainingContext},
//!     settings::FederationSettings,
//!     state_machine::StateMachineInitializer,
//!     transport::DirectTransport,
//! };
//!
//! let initial = ParameterSet::new(vec![Tensor::zeros("w", &[2])])?;
//! let trainer = |params: &ParameterSet, _: &TrainingContext| -> Result<ParameterSet, TrainError> {
//!     Ok(params.clone())
//! };
//! let transport = DirectTransport::new()
//!     .with_participant(Participant::new(ParticipantId::new(1), initial.clone(), 10), trainer)
//!     .with_participant(Participant::new(ParticipantId::new(2), initial.clone(), 30), trainer);
//! let coordinator = Coordinator::initialize(initial, transport.sample_counts())?;
//!
//! let (state_machine, _events) = StateMachineInitializer::new(
//!     FederationSettings::default(),
//!     coordinator,
//!     transport,
//!     RunContext::default(),
//! )
//! .init()?;
//! let global = state_machine.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`StateMachine`]: crate::state_machine::StateMachine
//! [`Transport`]: crate::transport::Transport
//! [`DirectTransport`]: crate::transport::DirectTransport
//! [`ProcessGroup`]: crate::transport::ProcessGroup
//! [`RemoteParticipant`]: crate::transport::RemoteParticipant
//! [`MessageTransport`]: crate::transport::MessageTransport

pub mod common;
pub mod coordinator;
pub mod message;
pub mod model;
pub mod participant;
pub mod settings;
pub mod state_machine;
pub mod transport;
