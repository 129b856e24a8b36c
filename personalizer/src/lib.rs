pub mod artifact;
pub mod classifier;
pub mod config;
pub mod encoder;
pub mod error;
pub mod orchestrator;
mod personalizer;
pub mod preprocess;
pub mod procedure;
pub mod provider;
pub mod store;

pub use artifact::{ArtifactBuilder, ImageConstraint, ModelArtifact, PixelFormat};
pub use classifier::{Classification, ClassifierService};
pub use config::PersonalizerConfig;
pub use encoder::{LabelPolicy, Sample, SampleEncoder, TrainingRecord, UpdateBatch};
pub use error::{PersonalizeErr, Result};
pub use orchestrator::{UpdateBase, UpdateOrchestrator, UpdateOutcome, UpdateState, UpdateTask};
pub use personalizer::Personalizer;
pub use preprocess::ResizeMode;
pub use procedure::{GradientUpdate, UpdateProcedure, UpdateProduct};
pub use provider::{ModelProvider, ModelSource};
pub use store::ModelStore;
