use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    PersonalizeErr, Result, encoder::LabelPolicy, orchestrator::UpdateBase,
    preprocess::ResizeMode, store::DEFAULT_MODEL_NAME,
};

/// Everything needed to open a `Personalizer`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PersonalizerConfig {
    /// The read-only artifact shipped with the application.
    pub bundled_model: PathBuf,
    /// The directory the updated artifact is persisted in.
    pub storage_root: PathBuf,
    pub updated_model_name: String,
    /// Where transient encoded samples are written.
    pub scratch_dir: PathBuf,
    pub resize: ResizeMode,
    pub labels: LabelPolicy,
    pub update_base: UpdateBase,
    /// How long `update_model` waits for an update, forever if unset.
    pub update_timeout_secs: Option<u64>,
}

impl Default for PersonalizerConfig {
    fn default() -> Self {
        Self {
            bundled_model: PathBuf::from("MoodModel.mdl"),
            storage_root: PathBuf::from("."),
            updated_model_name: DEFAULT_MODEL_NAME.to_string(),
            scratch_dir: env::temp_dir(),
            resize: ResizeMode::default(),
            labels: LabelPolicy::default(),
            update_base: UpdateBase::default(),
            update_timeout_secs: None,
        }
    }
}

impl PersonalizerConfig {
    /// Creates a default configuration for the given bundled artifact and storage directory.
    pub fn new(bundled_model: impl Into<PathBuf>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            bundled_model: bundled_model.into(),
            storage_root: storage_root.into(),
            ..Self::default()
        }
    }

    /// Reads a JSON configuration, missing fields take their default value.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let config: Self = serde_json::from_slice(&fs::read(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the configuration from the `MOOD_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from the `MOOD_*` keys `lookup` resolves, falling back to the
    /// defaults for the missing ones.
    ///
    /// # Arguments
    /// * `lookup` - Resolves a key such as `MOOD_STORAGE_ROOT` to its value, if set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("MOOD_BUNDLED_MODEL") {
            config.bundled_model = v.into();
        }
        if let Some(v) = lookup("MOOD_STORAGE_ROOT") {
            config.storage_root = v.into();
        }
        if let Some(v) = lookup("MOOD_UPDATED_MODEL_NAME") {
            config.updated_model_name = v;
        }
        if let Some(v) = lookup("MOOD_SCRATCH_DIR") {
            config.scratch_dir = v.into();
        }
        if let Some(v) = lookup("MOOD_RESIZE") {
            config.resize = parse_variant("MOOD_RESIZE", &v)?;
        }
        if let Some(v) = lookup("MOOD_LABELS") {
            config.labels = parse_variant("MOOD_LABELS", &v)?;
        }
        if let Some(v) = lookup("MOOD_UPDATE_BASE") {
            config.update_base = parse_variant("MOOD_UPDATE_BASE", &v)?;
        }
        if let Some(v) = lookup("MOOD_UPDATE_TIMEOUT_SECS") {
            let secs: u64 = v.trim().parse().map_err(|_| {
                PersonalizeErr::InvalidConfig(format!("MOOD_UPDATE_TIMEOUT_SECS is not a number: {v:?}"))
            })?;
            config.update_timeout_secs = Some(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration can open a `Personalizer`.
    pub fn validate(&self) -> Result<()> {
        if self.bundled_model.as_os_str().is_empty() {
            return Err(PersonalizeErr::InvalidConfig("bundled_model is empty".into()));
        }

        let name = self.updated_model_name.trim();
        if name.is_empty() {
            return Err(PersonalizeErr::InvalidConfig("updated_model_name is empty".into()));
        }

        if name.contains(['/', '\\']) {
            return Err(PersonalizeErr::InvalidConfig(format!(
                "updated_model_name must be a file name, got {name:?}"
            )));
        }

        if self.update_timeout_secs == Some(0) {
            return Err(PersonalizeErr::InvalidConfig(
                "update_timeout_secs must be positive".into(),
            ));
        }

        Ok(())
    }

    pub fn update_timeout(&self) -> Option<Duration> {
        self.update_timeout_secs.map(Duration::from_secs)
    }
}

fn parse_variant<T: DeserializeOwned>(key: &str, value: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_string()))
        .map_err(|e| PersonalizeErr::InvalidConfig(format!("{key}: {e}")))
}
