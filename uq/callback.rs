use crate::network::{NetworkError, Predictor};
use crate::types::MetricLog;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("Inference over the training set failed: {0}")]
    Predict(#[from] NetworkError),
    #[error("Training-set predictions have shape {found:?}, expected {expected:?}.")]
    PredictionShape {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("Training inputs have {x_rows} rows but training targets have {y_rows}.")]
    TrainingSetMismatch { x_rows: usize, y_rows: usize },
    #[error("The training set is empty.")]
    EmptyTrainingSet,
    #[error("The learning rate must be finite and positive, got {0}.")]
    InvalidLearningRate(f64),
}

/// What the trainer exposes to callbacks at the end of an epoch.
pub struct EpochContext<'a> {
    /// The model being trained, as it stands after the epoch's last batch.
    pub predictor: &'a dyn Predictor,
    /// The optimizer's current learning rate.
    pub learning_rate: f64,
}

/// A hook run once per epoch, after all of the epoch's batches and before the next
/// epoch starts.
pub trait EpochCallback {
    fn on_epoch_end(
        &mut self,
        epoch: usize,
        logs: &MetricLog,
        ctx: &EpochContext<'_>,
    ) -> Result<(), CallbackError>;
}
