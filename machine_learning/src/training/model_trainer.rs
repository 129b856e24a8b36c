use std::num::NonZeroUsize;

use log::debug;
use rand::Rng;

use super::Trainer;
use crate::{
    MlErr, Result,
    arch::{Model, loss::LossFn},
    dataset::Dataset,
    optimization::Optimizer,
};

/// A model `Trainer`. Contains the relevant components needed for training a model,
/// including the model itself.
pub struct ModelTrainer<M, O, L, R>
where
    M: Model,
    O: Optimizer,
    L: LossFn,
    R: Rng,
{
    model: M,
    optimizer: O,
    dataset: Dataset,
    loss_fn: L,

    epochs: NonZeroUsize,
    batch_size: NonZeroUsize,
    rng: R,
    grad: Vec<f32>,
}

impl<M, O, L, R> ModelTrainer<M, O, L, R>
where
    M: Model,
    O: Optimizer,
    L: LossFn,
    R: Rng,
{
    /// Returns a new `ModelTrainer`.
    ///
    /// # Arguments
    /// * `model` - The model that will be trained.
    /// * `optimizer` - The learning rule applied after every batch.
    /// * `dataset` - The dataset the model will be trained with.
    /// * `epochs` - The amount of passes over the dataset per `train` call.
    /// * `batch_size` - The amount of samples per gradient step.
    /// * `loss_fn` - The loss function used to measure the difference between a model's output and the expected one.
    /// * `rng` - A random number generator, used for shuffling the dataset every epoch.
    pub fn new(
        model: M,
        optimizer: O,
        dataset: Dataset,
        epochs: NonZeroUsize,
        batch_size: NonZeroUsize,
        loss_fn: L,
        rng: R,
    ) -> Self {
        Self {
            grad: vec![0.; model.size()],
            model,
            optimizer,
            dataset,
            loss_fn,
            epochs,
            batch_size,
            rng,
        }
    }

    /// Consumes the trainer giving back its model.
    pub fn into_model(self) -> M {
        self.model
    }
}

impl<M, O, L, R> Trainer for ModelTrainer<M, O, L, R>
where
    M: Model,
    O: Optimizer,
    L: LossFn,
    R: Rng,
{
    fn train(&mut self, params: &mut [f32]) -> Result<Vec<f32>> {
        if self.dataset.is_empty() {
            return Err(MlErr::EmptyDataset);
        }

        let epochs = self.epochs.get();
        let mut losses = Vec::with_capacity(epochs);

        for epoch in 0..epochs {
            self.dataset.shuffle(&mut self.rng);
            let batches = self.dataset.batches(self.batch_size);

            let loss = self.model.backprop(
                params,
                &mut self.grad,
                &mut self.optimizer,
                &self.loss_fn,
                batches,
            )?;

            if !loss.is_finite() {
                return Err(MlErr::NonFiniteLoss { epoch });
            }

            debug!(epoch = epoch, loss = loss; "finished training epoch");
            losses.push(loss);
        }

        Ok(losses)
    }
}
