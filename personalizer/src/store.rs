use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use log::{info, warn};

use crate::{PersonalizeErr, Result, artifact::ModelArtifact};

/// The file name the updated artifact is kept under by default.
pub const DEFAULT_MODEL_NAME: &str = "UpdatedModel.mdl";

/// Persists the personalized artifact so that it shadows the bundled one on the next load.
#[derive(Clone, Debug)]
pub struct ModelStore {
    root: PathBuf,
    name: String,
}

impl ModelStore {
    /// Creates a new `ModelStore` under `root` using the default file name.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_name(root, DEFAULT_MODEL_NAME)
    }

    pub fn with_name(root: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            name: name.into(),
        }
    }

    /// Returns the canonical path of the persisted artifact.
    pub fn path(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    /// Atomically replaces the persisted artifact.
    ///
    /// The artifact is written and synced to a uniquely named sibling file first and then
    /// renamed over the canonical path, so readers see either the old or the new artifact.
    /// The directory is synced afterwards so the new entry is durable.
    ///
    /// # Returns
    /// The canonical path or `Persistence` if any step failed, in which case the temporary
    /// file is removed.
    pub fn save(&self, artifact: &ModelArtifact) -> Result<PathBuf> {
        let bytes = artifact.to_bytes()?;
        fs::create_dir_all(&self.root).map_err(PersonalizeErr::Persistence)?;

        let path = self.path();
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", self.name, uuid::Uuid::new_v4()));

        if let Err(e) = write_synced(&tmp, &bytes).and_then(|_| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(PersonalizeErr::Persistence(e));
        }

        // The rename only survives a crash once the directory entry is flushed.
        if let Err(e) = sync_dir(&self.root) {
            warn!("couldn't sync {}: {e}", self.root.display());
        }

        info!(revision = artifact.revision(); "saved updated model to {}", path.display());
        Ok(path)
    }

    /// Loads the persisted artifact.
    ///
    /// # Returns
    /// `None` if nothing was persisted yet, or an error if the file can't be read or decoded.
    pub fn try_load(&self) -> Result<Option<ModelArtifact>> {
        let path = self.path();

        match fs::read(&path) {
            Ok(bytes) => ModelArtifact::from_bytes(&bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersonalizeErr::Io(e)),
        }
    }

    /// Loads the persisted artifact, logging and discarding any failure.
    pub fn load(&self) -> Option<ModelArtifact> {
        match self.try_load() {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!("ignoring the stored model at {}: {e}", self.path().display());
                None
            }
        }
    }

    /// Discards the persisted artifact.
    ///
    /// # Returns
    /// Whether there was one to remove.
    pub fn remove(&self) -> Result<bool> {
        match fs::remove_file(self.path()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PersonalizeErr::Persistence(e)),
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}
