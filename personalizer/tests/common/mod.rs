#![allow(dead_code)]

use std::{
    fs::File,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
};

use image::{DynamicImage, GrayImage, Luma};
use personalizer::{
    ArtifactBuilder, GradientUpdate, ImageConstraint, ModelArtifact, PersonalizerConfig,
    PixelFormat, Result, UpdateBatch, UpdateProcedure, UpdateProduct,
    artifact::{OptimizerSpec, UpdateDefaults},
};

pub const LABELS: [&str; 3] = ["happy", "sad", "neutral"];

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A linear model over a 4x4 grid whose only opinion is a bias towards "sad": every image
/// is classified as sad with 91% confidence.
pub fn sad_model() -> ModelArtifact {
    let input = ImageConstraint::new(224, 224, PixelFormat::Gray8);
    let builder = ArtifactBuilder::new(input, LABELS)
        .pooling_grid(4, 4)
        .update_defaults(UpdateDefaults {
            optimizer: OptimizerSpec::GradientDescent { lr: 0.5 },
            epochs: NonZeroUsize::new(10).unwrap(),
            batch_size: NonZeroUsize::new(1).unwrap(),
            seed: 7,
        });

    let mut params = vec![0.; 16 * 3];
    params.extend([0., 3.007, 0.]);
    builder.build_with(params).unwrap()
}

/// Writes the bundled model and returns a configuration rooted at `dir`.
pub fn setup(dir: &Path) -> PersonalizerConfig {
    let bundled = dir.join("MoodModel.mdl");
    sad_model()
        .write_to(&mut File::create(&bundled).unwrap())
        .unwrap();

    let mut config = PersonalizerConfig::new(&bundled, dir.join("storage"));
    config.scratch_dir = dir.join("scratch");
    config
}

pub fn scratch_files(config: &PersonalizerConfig) -> Vec<PathBuf> {
    match std::fs::read_dir(&config.scratch_dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

/// A neutral gray picture that doesn't match the model's input size.
pub fn gray_picture() -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_pixel(320, 240, Luma([128])))
}

/// Counts its runs before delegating to `GradientUpdate`.
#[derive(Clone, Default)]
pub struct Counting {
    pub calls: Arc<AtomicUsize>,
}

impl UpdateProcedure for Counting {
    fn run(&self, artifact: &ModelArtifact, batch: &UpdateBatch) -> Result<UpdateProduct> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        GradientUpdate.run(artifact, batch)
    }
}

/// Blocks every run until it's released through the returned sender.
pub struct Gated {
    release: Mutex<mpsc::Receiver<()>>,
}

impl Gated {
    pub fn new() -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                release: Mutex::new(rx),
            },
            tx,
        )
    }
}

impl UpdateProcedure for Gated {
    fn run(&self, artifact: &ModelArtifact, batch: &UpdateBatch) -> Result<UpdateProduct> {
        let _ = self.release.lock().unwrap().recv();
        GradientUpdate.run(artifact, batch)
    }
}
