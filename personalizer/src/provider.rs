use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;

use crate::{artifact::ModelArtifact, store::ModelStore};

/// Where the artifact currently served comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelSource {
    Bundled,
    Updated,
}

/// Serves the artifact inference should use.
///
/// A stored updated artifact shadows the bundled one as long as it loads and accepts the same
/// input. Readers get an `Arc` snapshot, so a `refresh` never affects in-flight requests.
#[derive(Debug)]
pub struct ModelProvider {
    bundled: Arc<ModelArtifact>,
    store: ModelStore,
    current: RwLock<(Arc<ModelArtifact>, ModelSource)>,
}

impl ModelProvider {
    /// Creates a new `ModelProvider`, selecting the artifact to serve right away.
    ///
    /// # Arguments
    /// * `bundled` - The artifact shipped with the application.
    /// * `store` - Where a personalized artifact may have been persisted.
    pub fn new(bundled: ModelArtifact, store: ModelStore) -> Self {
        let bundled = Arc::new(bundled);
        let selected = select(&bundled, &store);

        Self {
            bundled,
            store,
            current: RwLock::new(selected),
        }
    }

    /// Returns a snapshot of the artifact currently served.
    pub fn current(&self) -> Arc<ModelArtifact> {
        self.current.read().0.clone()
    }

    pub fn bundled(&self) -> Arc<ModelArtifact> {
        self.bundled.clone()
    }

    pub fn source(&self) -> ModelSource {
        self.current.read().1
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// Re-reads the store and swaps the served artifact.
    ///
    /// # Returns
    /// The source now being served.
    pub fn refresh(&self) -> ModelSource {
        let selected = select(&self.bundled, &self.store);
        let source = selected.1;

        info!(revision = selected.0.revision(); "serving the {source:?} model");
        *self.current.write() = selected;
        source
    }
}

fn select(bundled: &Arc<ModelArtifact>, store: &ModelStore) -> (Arc<ModelArtifact>, ModelSource) {
    match store.load() {
        Some(updated) if updated.input() == bundled.input() => {
            (Arc::new(updated), ModelSource::Updated)
        }
        Some(updated) => {
            warn!(
                "the stored model takes {} but the bundled one takes {}, falling back to bundled",
                updated.input(),
                bundled.input()
            );
            (bundled.clone(), ModelSource::Bundled)
        }
        None => (bundled.clone(), ModelSource::Bundled),
    }
}
