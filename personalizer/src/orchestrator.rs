use std::{path::PathBuf, sync::Arc, time::Duration};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::{
    runtime::Handle,
    sync::{Mutex, OwnedMutexGuard, watch},
    task::JoinHandle,
};

use crate::{
    PersonalizeErr, Result,
    artifact::ModelArtifact,
    encoder::{LabelPolicy, Sample, SampleEncoder, UpdateBatch},
    procedure::{GradientUpdate, UpdateProcedure},
    provider::ModelProvider,
};

/// Which artifact an update starts from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateBase {
    /// The artifact currently served, so updates accumulate.
    #[default]
    Active,
    /// Always the bundled artifact, so only the latest update survives.
    Bundled,
}

/// The lifecycle of the latest update.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum UpdateState {
    #[default]
    Idle,
    Submitted,
    Completed {
        revision: u64,
    },
    Failed(String),
}

/// What a successful update did.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateOutcome {
    pub revision: u64,
    pub path: PathBuf,
    /// The amount of samples that made it into the batch.
    pub records: usize,
    pub losses: Vec<f32>,
}

/// A submitted update running on the blocking pool.
///
/// Dropping it, or giving up on `wait_timeout`, doesn't cancel the update.
#[derive(Debug)]
pub struct UpdateTask {
    handle: JoinHandle<Result<UpdateOutcome>>,
}

impl UpdateTask {
    /// Waits for the update to finish.
    pub async fn wait(self) -> Result<UpdateOutcome> {
        self.handle
            .await
            .map_err(|e| PersonalizeErr::TaskFailed(e.to_string()))?
    }

    /// Waits for the update to finish for at most `timeout`.
    ///
    /// # Returns
    /// The update's result or `Timeout`, in which case the update keeps running.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<UpdateOutcome> {
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(joined) => joined.map_err(|e| PersonalizeErr::TaskFailed(e.to_string()))?,
            Err(_) => Err(PersonalizeErr::Timeout(timeout)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Runs one update at a time over the provider's artifact.
pub struct UpdateOrchestrator {
    job: UpdateJob,
    gate: Arc<Mutex<()>>,
    updating: Arc<watch::Sender<bool>>,
}

impl UpdateOrchestrator {
    /// Creates a new `UpdateOrchestrator` running `GradientUpdate`.
    ///
    /// # Arguments
    /// * `provider` - Serves the base artifact and gets refreshed after every save.
    /// * `encoder` - Turns the submitted samples into records.
    /// * `base` - Which artifact updates start from.
    pub fn new(provider: Arc<ModelProvider>, encoder: SampleEncoder, base: UpdateBase) -> Self {
        let (updating, _) = watch::channel(false);
        let (state, _) = watch::channel(UpdateState::Idle);

        Self {
            job: UpdateJob {
                provider,
                encoder,
                base,
                procedure: Arc::new(GradientUpdate),
                state: Arc::new(state),
            },
            gate: Arc::new(Mutex::new(())),
            updating: Arc::new(updating),
        }
    }

    /// Replaces the procedure that revises the artifact.
    pub fn with_procedure<P: UpdateProcedure + 'static>(mut self, procedure: P) -> Self {
        self.job.procedure = Arc::new(procedure);
        self
    }

    pub fn provider(&self) -> &Arc<ModelProvider> {
        &self.job.provider
    }

    /// Starts an update with `samples` without waiting for it.
    ///
    /// # Returns
    /// The running task, `EmptyBatch` if there are no samples, or `Busy` if another update is
    /// still running on this orchestrator.
    pub fn submit(&self, samples: Vec<Sample>) -> Result<UpdateTask> {
        if samples.is_empty() {
            return Err(PersonalizeErr::EmptyBatch);
        }

        let guard = self
            .gate
            .clone()
            .try_lock_owned()
            .map_err(|_| PersonalizeErr::Busy)?;

        let runtime = Handle::try_current().map_err(|e| PersonalizeErr::TaskFailed(e.to_string()))?;

        self.updating.send_replace(true);
        self.job.state.send_replace(UpdateState::Submitted);
        info!(samples = samples.len(); "update submitted");

        let flag = UpdatingFlag {
            updating: self.updating.clone(),
            state: self.job.state.clone(),
            _guard: guard,
        };
        let job = self.job.clone();

        let handle = runtime.spawn_blocking(move || {
            let _flag = flag;
            let result = job.run(samples);

            match &result {
                Ok(outcome) => {
                    info!(revision = outcome.revision, records = outcome.records; "update completed");
                    job.state.send_replace(UpdateState::Completed {
                        revision: outcome.revision,
                    });
                }
                Err(e) => {
                    warn!("update failed: {e}");
                    job.state.send_replace(UpdateState::Failed(e.to_string()));
                }
            }

            result
        });

        Ok(UpdateTask { handle })
    }

    /// Runs an update with `samples` and waits for it.
    pub async fn update(&self, samples: Vec<Sample>) -> Result<UpdateOutcome> {
        self.submit(samples)?.wait().await
    }

    /// Discards the persisted artifact so the bundled one is served again.
    ///
    /// # Returns
    /// Whether there was a persisted artifact, or `Busy` while an update is running.
    pub fn reset(&self) -> Result<bool> {
        let _guard = self
            .gate
            .clone()
            .try_lock_owned()
            .map_err(|_| PersonalizeErr::Busy)?;

        let removed = self.job.provider.store().remove()?;
        self.job.provider.refresh();
        self.job.state.send_replace(UpdateState::Idle);
        Ok(removed)
    }

    pub fn is_updating(&self) -> bool {
        *self.updating.borrow()
    }

    /// Returns a receiver notified every time an update starts or finishes.
    pub fn subscribe_updating(&self) -> watch::Receiver<bool> {
        self.updating.subscribe()
    }

    pub fn state(&self) -> UpdateState {
        self.job.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<UpdateState> {
        self.job.state.subscribe()
    }
}

/// Clears the updating flag and then releases the gate once the update is over, even if
/// it panicked.
struct UpdatingFlag {
    updating: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<UpdateState>>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for UpdatingFlag {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.state
                .send_replace(UpdateState::Failed("the update panicked".into()));
        }

        self.updating.send_replace(false);
    }
}

#[derive(Clone)]
struct UpdateJob {
    provider: Arc<ModelProvider>,
    encoder: SampleEncoder,
    base: UpdateBase,
    procedure: Arc<dyn UpdateProcedure>,
    state: Arc<watch::Sender<UpdateState>>,
}

impl UpdateJob {
    fn run(&self, samples: Vec<Sample>) -> Result<UpdateOutcome> {
        let base = match self.base {
            UpdateBase::Active => self.provider.current(),
            UpdateBase::Bundled => self.provider.bundled(),
        };

        let batch = self.encoder.encode_batch(&base, &samples);
        let revised = self.revise(&base, &batch);
        batch.cleanup();

        let (artifact, losses) = revised?;
        let path = self.provider.store().save(&artifact)?;
        self.provider.refresh();

        Ok(UpdateOutcome {
            revision: artifact.revision(),
            path,
            records: batch.len(),
            losses,
        })
    }

    fn revise(&self, base: &ModelArtifact, batch: &UpdateBatch) -> Result<(ModelArtifact, Vec<f32>)> {
        if batch.is_empty() {
            return Err(PersonalizeErr::EmptyBatch);
        }

        let mut artifact = base.clone();
        if self.encoder.label_policy() == LabelPolicy::FreeText {
            for record in batch.records() {
                if artifact.label_index(&record.label).is_none() {
                    info!("adding the label {:?} to the vocabulary", record.label);
                    artifact = artifact.with_label(&record.label)?;
                }
            }
        }

        let product = self.procedure.run(&artifact, batch)?;
        Ok((product.artifact, product.losses))
    }
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, GrayImage, Luma};

    use super::*;
    use crate::{
        artifact::{ArtifactBuilder, ImageConstraint, PixelFormat},
        preprocess::ResizeMode,
        store::ModelStore,
    };

    fn orchestrator(dir: &std::path::Path, base: UpdateBase) -> UpdateOrchestrator {
        let input = ImageConstraint::new(4, 4, PixelFormat::Gray8);
        let bundled = ArtifactBuilder::new(input, ["happy", "sad"])
            .pooling_grid(2, 2)
            .build(0)
            .unwrap();

        let provider = Arc::new(ModelProvider::new(bundled, ModelStore::new(dir.join("store"))));
        let encoder = SampleEncoder::new(dir.join("scratch"), ResizeMode::Stretch, LabelPolicy::FreeText);
        UpdateOrchestrator::new(provider, encoder, base)
    }

    fn sample(label: &str) -> Sample {
        Sample::new(DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 4, Luma([200]))), label)
    }

    #[tokio::test]
    async fn no_samples_is_rejected_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), UpdateBase::Active);

        assert!(matches!(orchestrator.submit(vec![]), Err(PersonalizeErr::EmptyBatch)));
        assert_eq!(orchestrator.state(), UpdateState::Idle);
        assert!(!orchestrator.is_updating());
    }

    #[tokio::test]
    async fn new_labels_expand_the_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), UpdateBase::Active);

        let outcome = orchestrator.update(vec![sample("surprised")]).await.unwrap();
        assert_eq!(outcome.revision, 1);
        assert_eq!(outcome.records, 1);
        assert_eq!(orchestrator.state(), UpdateState::Completed { revision: 1 });
        assert!(!orchestrator.is_updating());

        let current = orchestrator.provider().current();
        assert_eq!(current.labels(), ["happy", "sad", "surprised"]);
    }

    #[tokio::test]
    async fn bundled_base_doesnt_accumulate_revisions() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path(), UpdateBase::Bundled);

        let first = orchestrator.update(vec![sample("happy")]).await.unwrap();
        let second = orchestrator.update(vec![sample("sad")]).await.unwrap();
        assert_eq!(first.revision, 1);
        assert_eq!(second.revision, 1);

        let active = UpdateOrchestrator::new(
            orchestrator.provider().clone(),
            SampleEncoder::new(dir.path().join("scratch"), ResizeMode::Stretch, LabelPolicy::FreeText),
            UpdateBase::Active,
        );
        let third = active.update(vec![sample("sad")]).await.unwrap();
        assert_eq!(third.revision, 2);
    }
}
