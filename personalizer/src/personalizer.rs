use std::sync::Arc;

use image::DynamicImage;
use log::info;
use tokio::sync::watch;

use crate::{
    Result,
    artifact::ModelArtifact,
    classifier::{Classification, ClassifierService},
    config::PersonalizerConfig,
    encoder::{Sample, SampleEncoder},
    orchestrator::{UpdateOrchestrator, UpdateOutcome, UpdateState, UpdateTask},
    procedure::UpdateProcedure,
    provider::{ModelProvider, ModelSource},
    store::ModelStore,
};

/// The entry point of the pipeline: classifies images and learns from corrections.
pub struct Personalizer {
    config: PersonalizerConfig,
    classifier: ClassifierService,
    orchestrator: UpdateOrchestrator,
}

impl Personalizer {
    /// Opens a `Personalizer`, loading the bundled artifact the configuration points to.
    ///
    /// # Returns
    /// The personalizer or an error if the configuration is invalid or the bundled artifact
    /// can't be loaded, since nothing can be served without it.
    pub fn open(config: PersonalizerConfig) -> Result<Self> {
        config.validate()?;
        let bundled = ModelArtifact::read_from(&config.bundled_model)?;
        Ok(Self::with_bundled(config, bundled))
    }

    /// Creates a `Personalizer` around an already loaded bundled artifact.
    pub fn with_bundled(config: PersonalizerConfig, bundled: ModelArtifact) -> Self {
        let store = ModelStore::with_name(&config.storage_root, config.updated_model_name.trim());
        let provider = Arc::new(ModelProvider::new(bundled, store));
        info!("serving the {:?} model", provider.source());

        let classifier = ClassifierService::new(provider.clone(), config.resize);
        let encoder = SampleEncoder::new(&config.scratch_dir, config.resize, config.labels);
        let orchestrator = UpdateOrchestrator::new(provider, encoder, config.update_base);

        Self {
            config,
            classifier,
            orchestrator,
        }
    }

    /// Replaces the procedure updates run.
    pub fn with_procedure<P: UpdateProcedure + 'static>(mut self, procedure: P) -> Self {
        self.orchestrator = self.orchestrator.with_procedure(procedure);
        self
    }

    pub fn config(&self) -> &PersonalizerConfig {
        &self.config
    }

    pub fn classifier(&self) -> &ClassifierService {
        &self.classifier
    }

    pub fn provider(&self) -> &Arc<ModelProvider> {
        self.orchestrator.provider()
    }

    /// Classifies `image`, yielding `Classification::unknown()` on any failure.
    pub async fn classify(&self, image: DynamicImage) -> Classification {
        self.classifier.classify(image).await
    }

    pub async fn classify_bytes(&self, bytes: &[u8]) -> Classification {
        self.classifier.classify_bytes(bytes).await
    }

    /// Teaches the model that `image` shows `label`.
    ///
    /// Waits for at most the configured timeout, giving up waiting doesn't stop the update.
    pub async fn update_model(&self, image: DynamicImage, label: &str) -> Result<UpdateOutcome> {
        let task = self.submit_update(vec![Sample::new(image, label)])?;

        match self.config.update_timeout() {
            Some(timeout) => task.wait_timeout(timeout).await,
            None => task.wait().await,
        }
    }

    pub fn submit_update(&self, samples: Vec<Sample>) -> Result<UpdateTask> {
        self.orchestrator.submit(samples)
    }

    pub fn is_updating(&self) -> bool {
        self.orchestrator.is_updating()
    }

    pub fn subscribe_updating(&self) -> watch::Receiver<bool> {
        self.orchestrator.subscribe_updating()
    }

    pub fn update_state(&self) -> UpdateState {
        self.orchestrator.state()
    }

    /// Forgets every update, going back to the bundled artifact.
    pub fn reset_personalization(&self) -> Result<ModelSource> {
        if self.orchestrator.reset()? {
            info!("discarded the personalized model");
        }

        Ok(self.provider().source())
    }
}
