use std::{fmt, sync::Arc, time::Instant};

use image::DynamicImage;
use log::{debug, warn};

use crate::{
    PersonalizeErr, Result,
    preprocess::{self, ResizeMode},
    provider::ModelProvider,
};

/// The label reported when nothing could be classified.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// The single best label for an image.
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub label: String,
    /// Always within `[0, 1]`.
    pub confidence: f32,
}

impl Classification {
    /// Returns the sentinel classification, `Unknown` with no confidence.
    pub fn unknown() -> Self {
        Self {
            label: UNKNOWN_LABEL.to_string(),
            confidence: 0.,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.label == UNKNOWN_LABEL && self.confidence == 0.
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.2}%)", self.label, self.confidence * 100.)
    }
}

/// Classifies images with whatever artifact the provider currently serves.
#[derive(Clone, Debug)]
pub struct ClassifierService {
    provider: Arc<ModelProvider>,
    resize: ResizeMode,
}

impl ClassifierService {
    pub fn new(provider: Arc<ModelProvider>, resize: ResizeMode) -> Self {
        Self { provider, resize }
    }

    pub fn provider(&self) -> &Arc<ModelProvider> {
        &self.provider
    }

    /// Classifies `image` on the calling thread.
    ///
    /// # Returns
    /// The most probable label, or an error if the artifact can't run on the image.
    pub fn classify_blocking(&self, image: &DynamicImage) -> Result<Classification> {
        let start = Instant::now();
        let artifact = self.provider.current();
        let input = artifact.input();

        let conformed = preprocess::conform(image, input, self.resize);
        let features = preprocess::features(&conformed, input, artifact.pooling_grid())?;
        let probs = artifact.predict(&features)?;

        let classification = match top(&probs) {
            Some((i, p)) => Classification {
                label: artifact.labels()[i].clone(),
                confidence: p.clamp(0., 1.),
            },
            None => Classification::unknown(),
        };

        debug!(
            revision = artifact.revision(),
            elapsed_us = start.elapsed().as_micros() as u64;
            "classified as {classification}"
        );

        Ok(classification)
    }

    /// Classifies `image` on the blocking pool.
    pub async fn try_classify(&self, image: DynamicImage) -> Result<Classification> {
        let this = self.clone();

        tokio::task::spawn_blocking(move || this.classify_blocking(&image))
            .await
            .map_err(|e| PersonalizeErr::TaskFailed(e.to_string()))?
    }

    /// Classifies `image`, never failing: any error yields `Classification::unknown()`.
    pub async fn classify(&self, image: DynamicImage) -> Classification {
        match self.try_classify(image).await {
            Ok(classification) => classification,
            Err(e) => {
                warn!("classification failed, reporting {UNKNOWN_LABEL}: {e}");
                Classification::unknown()
            }
        }
    }

    /// Decodes an encoded image (PNG or JPEG) and classifies it like `classify`.
    pub async fn classify_bytes(&self, bytes: &[u8]) -> Classification {
        match image::load_from_memory(bytes) {
            Ok(image) => self.classify(image).await,
            Err(e) => {
                warn!("couldn't decode the image, reporting {UNKNOWN_LABEL}: {e}");
                Classification::unknown()
            }
        }
    }
}

/// Returns the index and value of the first maximum, skipping `NaN`s.
fn top(probs: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;

    for (i, &p) in probs.iter().enumerate() {
        if p.is_nan() {
            continue;
        }

        match best {
            Some((_, b)) if p <= b => {}
            _ => best = Some((i, p)),
        }
    }

    best
}
