use fedavg::{
    common::ParticipantId,
    model::{ModelError, ParameterSet, Tensor},
    participant::{TrainError, Trainer, TrainingContext},
};
use tracing::debug;

/// A stand-in for real training: every pass moves the parameters a step towards the
/// participant's private optimum.
pub struct SyntheticTrainer {
    optimum: ParameterSet,
    learning_rate: f64,
}

impl SyntheticTrainer {
    /// The private optimum of a participant has all its parameters set to its id.
    pub fn new(
        participant: ParticipantId,
        model: &ParameterSet,
        learning_rate: f64,
    ) -> Result<Self, ModelError> {
        let value = u64::from(participant) as f64;
        let optimum = ParameterSet::new(
            model
                .iter()
                .map(|tensor| Tensor::new(tensor.name(), tensor.data().mapv(|_| value)))
                .collect(),
        )?;
        Ok(Self {
            optimum,
            learning_rate,
        })
    }
}

impl Trainer for SyntheticTrainer {
    fn train(
        &mut self,
        params: &ParameterSet,
        ctx: &TrainingContext,
    ) -> Result<ParameterSet, TrainError> {
        debug!("epoch {} of round {} on {}", ctx.epoch, ctx.round, ctx.device);
        let mut step = self.optimum.clone();
        step.scaled_add(-1.0, params).map_err(TrainError::new)?;
        let mut trained = params.clone();
        trained
            .scaled_add(self.learning_rate, &step)
            .map_err(TrainError::new)?;
        Ok(trained)
    }
}
