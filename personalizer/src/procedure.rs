use machine_learning::{
    arch::loss::CrossEntropy,
    dataset::Dataset,
    training::{ModelTrainer, Trainer},
};
use rand::{SeedableRng, rngs::StdRng};

use crate::{PersonalizeErr, Result, artifact::ModelArtifact, encoder::UpdateBatch};

/// What a successful update procedure produces.
#[derive(Clone, Debug)]
pub struct UpdateProduct {
    pub artifact: ModelArtifact,
    /// The training loss of every epoch, in order.
    pub losses: Vec<f32>,
}

/// Incrementally revises an artifact with a batch of corrected samples.
///
/// Implementations must start from the artifact's current parameters and use the update
/// defaults it carries. Every label in the batch is already part of the artifact's vocabulary.
pub trait UpdateProcedure: Send + Sync {
    fn run(&self, artifact: &ModelArtifact, batch: &UpdateBatch) -> Result<UpdateProduct>;
}

/// Fine-tunes the artifact's network with softmax cross entropy over one-hot labels.
#[derive(Clone, Copy, Debug, Default)]
pub struct GradientUpdate;

impl UpdateProcedure for GradientUpdate {
    fn run(&self, artifact: &ModelArtifact, batch: &UpdateBatch) -> Result<UpdateProduct> {
        if batch.is_empty() {
            return Err(PersonalizeErr::EmptyBatch);
        }

        let classes = artifact.labels().len();
        let feature_len = artifact.header().feature_len();
        let mut data = Vec::with_capacity(batch.len() * (feature_len + classes));

        for record in batch.records() {
            let Some(class) = artifact.label_index(&record.label) else {
                return Err(PersonalizeErr::UnknownLabel(record.label.clone()));
            };

            if record.features.len() != feature_len {
                return Err(PersonalizeErr::ConstraintMismatch {
                    expected: format!("{feature_len} features"),
                    got: format!("{} features", record.features.len()),
                });
            }

            data.extend_from_slice(&record.features);
            data.extend((0..classes).map(|i| if i == class { 1. } else { 0. }));
        }

        let dataset =
            Dataset::new(data, feature_len, classes).map_err(PersonalizeErr::UpdateProcedure)?;
        let defaults = artifact.update_defaults();
        let mut params = artifact.params().to_vec();

        let mut trainer = ModelTrainer::new(
            artifact.network(),
            defaults.optimizer.build(),
            dataset,
            defaults.epochs,
            defaults.batch_size,
            CrossEntropy,
            StdRng::seed_from_u64(defaults.seed),
        );

        let losses = trainer
            .train(&mut params)
            .map_err(PersonalizeErr::UpdateProcedure)?;

        Ok(UpdateProduct {
            artifact: artifact.revised(params)?,
            losses,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroUsize, path::PathBuf};

    use super::*;
    use crate::{
        artifact::{ArtifactBuilder, ImageConstraint, OptimizerSpec, PixelFormat, UpdateDefaults},
        encoder::TrainingRecord,
    };

    fn artifact() -> ModelArtifact {
        let input = ImageConstraint::new(2, 1, PixelFormat::Gray8);
        ArtifactBuilder::new(input, ["happy", "sad"])
            .pooling_grid(2, 1)
            .update_defaults(UpdateDefaults {
                optimizer: OptimizerSpec::GradientDescent { lr: 0.5 },
                epochs: NonZeroUsize::new(30).unwrap(),
                batch_size: NonZeroUsize::new(2).unwrap(),
                seed: 9,
            })
            .build_with(vec![0.; 6])
            .unwrap()
    }

    fn record(features: [f32; 2], label: &str) -> TrainingRecord {
        TrainingRecord {
            features: features.to_vec(),
            label: label.into(),
            transient: PathBuf::new(),
        }
    }

    #[test]
    fn update_moves_predictions_towards_the_labels() {
        let artifact = artifact();
        let batch = UpdateBatch::new(vec![record([1., 0.], "happy"), record([0., 1.], "sad")]);

        let product = GradientUpdate.run(&artifact, &batch).unwrap();
        assert_eq!(product.losses.len(), 30);
        assert_eq!(product.artifact.revision(), 1);
        assert_eq!(product.artifact.labels(), artifact.labels());

        let happy = product.artifact.predict(&[1., 0.]).unwrap();
        let sad = product.artifact.predict(&[0., 1.]).unwrap();
        assert!(happy[0] > 0.5);
        assert!(sad[1] > 0.5);
    }

    #[test]
    fn updates_are_reproducible() {
        let artifact = artifact();
        let batch = UpdateBatch::new(vec![record([1., 0.], "happy"), record([0.5, 1.], "sad")]);

        let a = GradientUpdate.run(&artifact, &batch).unwrap();
        let b = GradientUpdate.run(&artifact, &batch).unwrap();
        assert_eq!(a.artifact.params(), b.artifact.params());
    }

    #[test]
    fn empty_and_unlabeled_batches_are_rejected() {
        let artifact = artifact();

        let empty = GradientUpdate.run(&artifact, &UpdateBatch::default());
        assert!(matches!(empty, Err(PersonalizeErr::EmptyBatch)));

        let unknown = GradientUpdate.run(&artifact, &UpdateBatch::new(vec![record([0., 0.], "angry")]));
        assert!(matches!(unknown, Err(PersonalizeErr::UnknownLabel(_))));
    }
}
