use std::{
    fs, io,
    path::{Path, PathBuf},
};

use image::{DynamicImage, ImageFormat};
use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    PersonalizeErr, Result,
    artifact::ModelArtifact,
    classifier::UNKNOWN_LABEL,
    preprocess::{self, ResizeMode},
};

/// An image together with the label the user says it shows.
#[derive(Clone, Debug)]
pub struct Sample {
    pub image: DynamicImage,
    pub label: String,
}

impl Sample {
    pub fn new(image: DynamicImage, label: impl Into<String>) -> Self {
        Self {
            image,
            label: label.into(),
        }
    }
}

/// A sample turned into what the update procedure consumes.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingRecord {
    pub features: Vec<f32>,
    pub label: String,
    /// The encoded image on disk, removed by `UpdateBatch::cleanup`.
    pub transient: PathBuf,
}

/// The records of a single update, in submission order.
#[derive(Clone, Debug, Default)]
pub struct UpdateBatch {
    records: Vec<TrainingRecord>,
}

impl UpdateBatch {
    pub fn new(records: Vec<TrainingRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[TrainingRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Removes the transient files of every record.
    pub fn cleanup(&self) {
        for record in &self.records {
            match fs::remove_file(&record.transient) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("couldn't remove {}: {e}", record.transient.display()),
            }
        }
    }
}

/// Which corrective labels are accepted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelPolicy {
    /// Any non blank label other than `UNKNOWN_LABEL`, unseen ones become new classes.
    #[default]
    FreeText,
    /// Only labels the artifact already outputs.
    Vocabulary,
}

/// Turns samples into training records conforming to an artifact's input constraint.
#[derive(Clone, Debug)]
pub struct SampleEncoder {
    scratch_dir: PathBuf,
    resize: ResizeMode,
    labels: LabelPolicy,
}

impl SampleEncoder {
    /// Creates a new `SampleEncoder`.
    ///
    /// # Arguments
    /// * `scratch_dir` - Where the transient encoded images are written.
    /// * `resize` - How non conforming images are resized, the classifier must use the same.
    /// * `labels` - Which labels are accepted.
    pub fn new(scratch_dir: impl Into<PathBuf>, resize: ResizeMode, labels: LabelPolicy) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            resize,
            labels,
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn label_policy(&self) -> LabelPolicy {
        self.labels
    }

    /// Encodes a single sample for `artifact`.
    ///
    /// The image is conformed, written as a PNG to a uniquely named scratch file and read back,
    /// so the record holds exactly what was persisted.
    ///
    /// Blank labels and the `UNKNOWN_LABEL` sentinel are rejected under every policy.
    ///
    /// # Returns
    /// The record or an error if the label is rejected or the image can't be encoded.
    pub fn try_encode(
        &self,
        artifact: &ModelArtifact,
        image: &DynamicImage,
        label: &str,
    ) -> Result<TrainingRecord> {
        let label = label.trim();
        if label.is_empty() || label == UNKNOWN_LABEL {
            return Err(PersonalizeErr::InvalidLabel);
        }

        if self.labels == LabelPolicy::Vocabulary && artifact.label_index(label).is_none() {
            return Err(PersonalizeErr::UnknownLabel(label.to_string()));
        }

        let input = artifact.input();
        let conformed = preprocess::conform(image, input, self.resize);

        fs::create_dir_all(&self.scratch_dir)?;
        let transient = self
            .scratch_dir
            .join(format!("mood-sample-{}.png", uuid::Uuid::new_v4()));

        let features = conformed
            .save_with_format(&transient, ImageFormat::Png)
            .map_err(PersonalizeErr::from)
            .and_then(|_| read_features(&transient, artifact));

        match features {
            Ok(features) => {
                debug!("encoded a {label:?} sample into {}", transient.display());
                Ok(TrainingRecord {
                    features,
                    label: label.to_string(),
                    transient,
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&transient);
                Err(e)
            }
        }
    }

    /// Encodes a single sample, logging and dropping it on failure.
    pub fn encode(
        &self,
        artifact: &ModelArtifact,
        image: &DynamicImage,
        label: &str,
    ) -> Option<TrainingRecord> {
        match self.try_encode(artifact, image, label) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("dropping a {label:?} sample: {e}");
                None
            }
        }
    }

    /// Encodes every sample in parallel, silently dropping the ones that fail.
    ///
    /// # Returns
    /// The batch of records in the same order as `samples`.
    pub fn encode_batch(&self, artifact: &ModelArtifact, samples: &[Sample]) -> UpdateBatch {
        let records = samples
            .par_iter()
            .filter_map(|sample| self.encode(artifact, &sample.image, &sample.label))
            .collect();

        UpdateBatch::new(records)
    }
}

fn read_features(path: &Path, artifact: &ModelArtifact) -> Result<Vec<f32>> {
    let decoded = image::open(path)?;
    preprocess::features(&decoded, artifact.input(), artifact.pooling_grid())
}
