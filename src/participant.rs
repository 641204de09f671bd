//! The participant side of FedAVG.
//!
//! A [`Participant`] owns a local copy of the model and the number of private samples it trains
//! on. Training itself is delegated to a [`Trainer`], which is the only component that ever
//! touches the private data.

use std::error::Error;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    common::{Device, ParticipantId},
    model::{ParameterSet, ShapeMismatch},
};

/// What a [`Trainer`] knows about the pass it is asked to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrainingContext {
    pub participant: ParticipantId,
    /// The round the participant is training for.
    pub round: u64,
    /// The pass within the local update, starting at `0`.
    pub epoch: u32,
    pub device: Device,
}

#[derive(Debug, Error)]
#[error("local training failed: {0}")]
/// An error reported by a [`Trainer`].
pub struct TrainError(Box<dyn Error + Send + Sync>);

impl TrainError {
    /// Wraps any error raised by the training code.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self(error.into())
    }
}

/// One local training pass over the private data of a participant.
///
/// Implementations must return a parameter set with the same tensor names and shapes as the one
/// they were given.
pub trait Trainer {
    /// Trains `params` for one pass and returns the result.
    fn train(
        &mut self,
        params: &ParameterSet,
        ctx: &TrainingContext,
    ) -> Result<ParameterSet, TrainError>;
}

impl<F> Trainer for F
where
    F: FnMut(&ParameterSet, &TrainingContext) -> Result<ParameterSet, TrainError>,
{
    fn train(
        &mut self,
        params: &ParameterSet,
        ctx: &TrainingContext,
    ) -> Result<ParameterSet, TrainError> {
        self(params, ctx)
    }
}

#[derive(Debug, Error)]
/// Errors which can occur during a local update.
pub enum LocalUpdateError {
    #[error(transparent)]
    Training(#[from] TrainError),
    #[error("the trainer changed the model in epoch {epoch}: {source}")]
    Shape { epoch: u32, source: ShapeMismatch },
    #[error("local training diverged in epoch {epoch}: tensor `{tensor}` is not finite")]
    Diverged { epoch: u32, tensor: String },
}

/// A party holding a local model and a fixed number of private samples.
#[derive(Debug, Clone)]
pub struct Participant {
    id: ParticipantId,
    params: ParameterSet,
    sample_count: u64,
    round: u64,
    device: Device,
}

impl Participant {
    /// Creates a participant whose model is shaped like `params`.
    ///
    /// The sample count is computed once from the private dataset and never changes.
    pub fn new(id: ParticipantId, params: ParameterSet, sample_count: u64) -> Self {
        Self {
            id,
            params,
            sample_count,
            round: 0,
            device: Device::default(),
        }
    }

    /// Sets the device handed to the trainer.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// The number of local updates completed so far.
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    /// Overwrites the local parameters.
    ///
    /// # Errors
    /// Fails if `params` doesn't have the tensor names and shapes of the local model, in which
    /// case the local parameters are left untouched.
    pub fn set_parameters(&mut self, params: ParameterSet) -> Result<(), ShapeMismatch> {
        self.params.check_compatible(&params)?;
        self.params = params;
        Ok(())
    }

    /// Runs `epochs` passes of the trainer, starting from the current local parameters.
    ///
    /// On success the local parameters are replaced by the trained ones, the round counter is
    /// incremented and the trained parameters are returned along with the sample count. On
    /// failure the participant is left as it was.
    pub fn local_update<T>(
        &mut self,
        trainer: &mut T,
        epochs: u32,
    ) -> Result<(ParameterSet, u64), LocalUpdateError>
    where
        T: Trainer + ?Sized,
    {
        info!(
            participant = %self.id,
            round = self.round,
            epochs,
            "starting local update"
        );
        let mut params = self.params.clone();
        for epoch in 0..epochs {
            let ctx = TrainingContext {
                participant: self.id,
                round: self.round,
                epoch,
                device: self.device,
            };
            let trained = trainer.train(&params, &ctx).map_err(|err| {
                warn!("local training failed in epoch {}: {}", epoch, err);
                err
            })?;
            self.params
                .check_compatible(&trained)
                .map_err(|source| LocalUpdateError::Shape { epoch, source })?;
            if let Some(tensor) = trained.first_non_finite() {
                return Err(LocalUpdateError::Diverged {
                    epoch,
                    tensor: tensor.to_string(),
                });
            }
            debug!("epoch {} done", epoch);
            params = trained;
        }

        self.params = params.clone();
        self.round += 1;
        Ok((params, self.sample_count))
    }
}
