use std::{
    collections::HashSet,
    fmt,
    fs::File,
    io::{BufReader, Read, Write},
    mem,
    num::NonZeroUsize,
    path::Path,
};

use machine_learning::{
    arch::{Model, Sequential, activations::ActFn, layers::Layer, loss::softmax_rows},
    initialization::ParamGen,
    optimization::{GradientDescent, GradientDescentWithMomentum, Optimizer},
};
use ndarray::ArrayView2;
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::{PersonalizeErr, Result};

const MAGIC: &[u8; 8] = b"MOODMDL1";

type HeaderLen = u32;
const HEADER_LEN_SIZE: usize = size_of::<HeaderLen>();

/// The pixel layout a model expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgb8,
    Gray8,
}

impl PixelFormat {
    /// Returns the amount of channels per pixel.
    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Rgb8 => write!(f, "rgb8"),
            PixelFormat::Gray8 => write!(f, "gray8"),
        }
    }
}

/// The image dimensions and pixel format a model accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConstraint {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl ImageConstraint {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }
}

impl fmt::Display for ImageConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.format)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ActFnSpec {
    Sigmoid { amp: f32 },
    Relu,
}

impl From<ActFnSpec> for ActFn {
    fn from(value: ActFnSpec) -> Self {
        match value {
            ActFnSpec::Sigmoid { amp } => ActFn::sigmoid(amp),
            ActFnSpec::Relu => ActFn::relu(),
        }
    }
}

/// A dense layer in the artifact's topology.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub input: usize,
    pub output: usize,
    #[serde(default)]
    pub act_fn: Option<ActFnSpec>,
}

impl LayerSpec {
    /// Returns the amount of parameters of the layer, or `None` if it doesn't fit a `usize`.
    pub fn size(&self) -> Option<usize> {
        self.input.checked_add(1)?.checked_mul(self.output)
    }
}

fn param_count(layers: &[LayerSpec]) -> Option<usize> {
    layers
        .iter()
        .try_fold(0usize, |total, spec| total.checked_add(spec.size()?))
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OptimizerSpec {
    GradientDescent { lr: f32 },
    Momentum { lr: f32, mu: f32 },
}

impl OptimizerSpec {
    /// Builds a fresh optimizer following this spec.
    pub fn build(&self) -> Box<dyn Optimizer + Send> {
        match *self {
            OptimizerSpec::GradientDescent { lr } => Box::new(GradientDescent::new(lr)),
            OptimizerSpec::Momentum { lr, mu } => Box::new(GradientDescentWithMomentum::new(lr, mu)),
        }
    }
}

/// The hyperparameters an update uses when the caller supplies none.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateDefaults {
    pub optimizer: OptimizerSpec,
    pub epochs: NonZeroUsize,
    pub batch_size: NonZeroUsize,
    pub seed: u64,
}

impl Default for UpdateDefaults {
    fn default() -> Self {
        Self {
            optimizer: OptimizerSpec::GradientDescent { lr: 0.1 },
            epochs: NonZeroUsize::MIN.saturating_add(9),
            batch_size: NonZeroUsize::MIN.saturating_add(7),
            seed: 0,
        }
    }
}

/// The self-describing part of a stored artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub revision: u64,
    pub input: ImageConstraint,
    /// The `(columns, rows)` of cells the image is average pooled into.
    pub pooling_grid: (u32, u32),
    pub labels: Vec<String>,
    pub layers: Vec<LayerSpec>,
    pub update: UpdateDefaults,
    pub param_count: usize,
}

impl ArtifactHeader {
    /// Returns the amount of features a pooled image has.
    pub fn feature_len(&self) -> usize {
        self.checked_feature_len().unwrap_or(usize::MAX)
    }

    fn checked_feature_len(&self) -> Option<usize> {
        let (cols, rows) = self.pooling_grid;
        (cols as usize)
            .checked_mul(rows as usize)?
            .checked_mul(self.input.format.channels())
    }

    fn validate(&self) -> Result<()> {
        let corrupt = |detail: String| Err(PersonalizeErr::CorruptArtifact(detail));

        if self.input.width == 0 || self.input.height == 0 {
            return corrupt(format!("empty input constraint {}", self.input));
        }

        let (cols, rows) = self.pooling_grid;
        if cols == 0 || rows == 0 || cols > self.input.width || rows > self.input.height {
            return corrupt(format!("pooling grid {cols}x{rows} doesn't fit {}", self.input));
        }

        if self.labels.is_empty() {
            return corrupt("the label vocabulary is empty".into());
        }

        let mut seen = HashSet::with_capacity(self.labels.len());
        if let Some(dup) = self.labels.iter().find(|label| !seen.insert(label.as_str())) {
            return corrupt(format!("the label {dup:?} is repeated"));
        }

        let (Some(first), Some(last)) = (self.layers.first(), self.layers.last()) else {
            return corrupt("the topology has no layers".into());
        };

        let Some(feature_len) = self.checked_feature_len() else {
            return corrupt(format!("the pooling grid {cols}x{rows} is too large"));
        };

        if first.input != feature_len {
            return corrupt(format!(
                "the first layer takes {} inputs but images pool into {feature_len} features",
                first.input
            ));
        }

        if last.output != self.labels.len() {
            return corrupt(format!(
                "the last layer has {} outputs for {} labels",
                last.output,
                self.labels.len()
            ));
        }

        if let Some(pair) = self.layers.windows(2).find(|w| w[0].output != w[1].input) {
            return corrupt(format!(
                "a layer outputs {} values into a layer taking {}",
                pair[0].output, pair[1].input
            ));
        }

        let Some(expected) = param_count(&self.layers) else {
            return corrupt("the topology has too many parameters".into());
        };

        if self.param_count != expected {
            return corrupt(format!(
                "the header declares {} parameters but the topology has {expected}",
                self.param_count
            ));
        }

        Ok(())
    }
}

/// An immutable, versioned classification model.
///
/// Revisions and label expansions produce new artifacts, a loaded one never changes.
#[derive(Clone, Debug)]
pub struct ModelArtifact {
    header: ArtifactHeader,
    params: Vec<f32>,
    model: Sequential,
}

impl ModelArtifact {
    /// Creates a new `ModelArtifact`.
    ///
    /// # Arguments
    /// * `header` - The description of the model.
    /// * `params` - The flat parameters of every layer, in order.
    ///
    /// # Returns
    /// A new `ModelArtifact` or `CorruptArtifact` if the header and the parameters disagree.
    pub fn new(header: ArtifactHeader, params: Vec<f32>) -> Result<Self> {
        header.validate()?;

        if params.len() != header.param_count {
            return Err(PersonalizeErr::CorruptArtifact(format!(
                "got {} parameters, expected {}",
                params.len(),
                header.param_count
            )));
        }

        let model = Sequential::new(
            header
                .layers
                .iter()
                .map(|spec| Layer::dense((spec.input, spec.output), spec.act_fn.map(Into::into))),
        );

        Ok(Self {
            header,
            params,
            model,
        })
    }

    pub fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    pub fn revision(&self) -> u64 {
        self.header.revision
    }

    pub fn input(&self) -> ImageConstraint {
        self.header.input
    }

    pub fn labels(&self) -> &[String] {
        &self.header.labels
    }

    pub fn pooling_grid(&self) -> (u32, u32) {
        self.header.pooling_grid
    }

    pub fn update_defaults(&self) -> UpdateDefaults {
        self.header.update
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    /// Returns a fresh copy of the trainable network.
    pub fn network(&self) -> Sequential {
        self.model.clone()
    }

    pub fn label_index(&self, label: &str) -> Option<usize> {
        self.header.labels.iter().position(|l| l == label)
    }

    /// Returns the next revision of this artifact, holding `params`.
    pub fn revised(&self, params: Vec<f32>) -> Result<Self> {
        let mut header = self.header.clone();
        header.revision += 1;
        Self::new(header, params)
    }

    /// Returns an artifact that can also output `label`.
    ///
    /// A zero-initialized column is appended to the last layer, so the logits of the
    /// existing labels stay the same. If `label` is already known the artifact is cloned.
    pub fn with_label(&self, label: &str) -> Result<Self> {
        if self.label_index(label).is_some() {
            return Ok(self.clone());
        }

        let mut header = self.header.clone();
        let Some(last) = header.layers.last_mut() else {
            return Err(PersonalizeErr::CorruptArtifact("the topology has no layers".into()));
        };

        let (n, m) = (last.input, last.output);
        let start = last
            .size()
            .and_then(|size| self.params.len().checked_sub(size))
            .ok_or_else(|| {
                PersonalizeErr::CorruptArtifact("the last layer doesn't fit the parameters".into())
            })?;
        let (front, tail) = self.params.split_at(start);
        let (weights, biases) = tail.split_at(n * m);

        let mut params = Vec::with_capacity(self.params.len() + n + 1);
        params.extend_from_slice(front);
        for row in weights.chunks_exact(m) {
            params.extend_from_slice(row);
            params.push(0.);
        }
        params.extend_from_slice(biases);
        params.push(0.);

        last.output += 1;
        header.labels.push(label.to_string());
        header.param_count = params.len();

        Self::new(header, params)
    }

    /// Computes the raw scores of every label.
    ///
    /// # Arguments
    /// * `features` - A pooled image, as produced by `preprocess::features`.
    ///
    /// # Returns
    /// One logit per label or an error if the features don't fit the first layer.
    pub fn logits(&self, features: &[f32]) -> Result<Vec<f32>> {
        let x = ArrayView2::from_shape((1, features.len()), features).map_err(|_| {
            PersonalizeErr::CorruptArtifact("the features don't form a single row".into())
        })?;

        let out = self.model.predict(&self.params, x)?;
        Ok(out.iter().copied().collect())
    }

    /// Computes the probability of every label.
    pub fn predict(&self, features: &[f32]) -> Result<Vec<f32>> {
        let logits = self.logits(features)?;
        let x = ArrayView2::from_shape((1, logits.len()), &logits).map_err(|_| {
            PersonalizeErr::CorruptArtifact("the logits don't form a single row".into())
        })?;

        Ok(softmax_rows(x).iter().copied().collect())
    }

    /// Encodes the artifact into its on-disk form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(&self.header)?;
        let header_len = HeaderLen::try_from(header.len()).map_err(|_| {
            PersonalizeErr::CorruptArtifact(format!("the header is too long, {} bytes", header.len()))
        })?;

        let payload: &[u8] = bytemuck::cast_slice(&self.params);
        let mut buf = Vec::with_capacity(MAGIC.len() + HEADER_LEN_SIZE + header.len() + payload.len());

        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&header_len.to_be_bytes());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    /// Decodes an artifact from its on-disk form.
    ///
    /// # Returns
    /// The artifact or `CorruptArtifact` if any section is missing or inconsistent.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let corrupt = |detail: &str| PersonalizeErr::CorruptArtifact(detail.to_string());

        let rest = buf.strip_prefix(MAGIC).ok_or_else(|| corrupt("bad magic"))?;
        let (len_buf, rest) = rest
            .split_first_chunk::<HEADER_LEN_SIZE>()
            .ok_or_else(|| corrupt("truncated header length"))?;

        let header_len = HeaderLen::from_be_bytes(*len_buf) as usize;
        if rest.len() < header_len {
            return Err(corrupt("truncated header"));
        }

        let (header_buf, payload) = rest.split_at(header_len);
        let header: ArtifactHeader = serde_json::from_slice(header_buf)
            .map_err(|e| PersonalizeErr::CorruptArtifact(format!("unreadable header: {e}")))?;

        let expected = header
            .param_count
            .checked_mul(size_of::<f32>())
            .ok_or_else(|| corrupt("the parameter count overflows"))?;

        if payload.len() != expected {
            return Err(PersonalizeErr::CorruptArtifact(format!(
                "got {} parameter bytes, expected {expected}",
                payload.len()
            )));
        }

        let mut params = vec![0f32; header.param_count];
        bytemuck::cast_slice_mut::<f32, u8>(&mut params).copy_from_slice(payload);

        Self::new(header, params)
    }

    /// Reads and decodes the artifact stored at `path`.
    pub fn read_from(path: &Path) -> Result<Self> {
        let mut buf = Vec::new();
        BufReader::new(File::open(path)?).read_to_end(&mut buf)?;
        Self::from_bytes(&buf)
    }

    /// Encodes the artifact into `writer`.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes()?)?;
        Ok(())
    }
}

/// Builds freshly initialized artifacts, used for shipping a bundled model.
#[derive(Clone, Debug)]
pub struct ArtifactBuilder {
    input: ImageConstraint,
    labels: Vec<String>,
    pooling_grid: (u32, u32),
    hidden: Vec<(usize, Option<ActFnSpec>)>,
    weights: Option<ParamGen>,
    update: UpdateDefaults,
}

impl ArtifactBuilder {
    /// Creates a new `ArtifactBuilder` for a linear classifier over an 8x8 pooling grid.
    pub fn new<I, S>(input: ImageConstraint, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            input,
            labels: labels.into_iter().map(Into::into).collect(),
            pooling_grid: (8, 8),
            hidden: Vec::new(),
            weights: None,
            update: UpdateDefaults::default(),
        }
    }

    pub fn pooling_grid(mut self, cols: u32, rows: u32) -> Self {
        self.pooling_grid = (cols, rows);
        self
    }

    /// Adds a hidden layer of `units` outputs before the classification layer.
    pub fn hidden(mut self, units: usize, act_fn: Option<ActFnSpec>) -> Self {
        self.hidden.push((units, act_fn));
        self
    }

    pub fn update_defaults(mut self, update: UpdateDefaults) -> Self {
        self.update = update;
        self
    }

    /// Draws every layer's weights from `weights` instead of a Xavier uniform sized to the layer.
    pub fn weight_init(mut self, weights: ParamGen) -> Self {
        self.weights = Some(weights);
        self
    }

    fn header(&self) -> Result<ArtifactHeader> {
        let mut header = ArtifactHeader {
            revision: 0,
            input: self.input,
            pooling_grid: self.pooling_grid,
            labels: self.labels.clone(),
            layers: Vec::new(),
            update: self.update,
            param_count: 0,
        };

        let mut input = header.feature_len();
        let mut layers = Vec::with_capacity(self.hidden.len() + 1);

        for &(units, act_fn) in &self.hidden {
            layers.push(LayerSpec {
                input,
                output: units,
                act_fn,
            });
            input = units;
        }

        layers.push(LayerSpec {
            input,
            output: self.labels.len(),
            act_fn: None,
        });

        header.param_count = param_count(&layers).unwrap_or(usize::MAX);
        header.layers = layers;
        header.validate()?;
        Ok(header)
    }

    /// Builds the artifact with freshly drawn weights and zero biases.
    ///
    /// # Returns
    /// The artifact or an error if the topology is inconsistent or the weight distribution
    /// is invalid.
    pub fn build(&self, seed: u64) -> Result<ModelArtifact> {
        let header = self.header()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut params = vec![0.; header.param_count];
        let mut rest = params.as_mut_slice();

        for spec in &header.layers {
            let (layer, tail) =
                mem::take(&mut rest).split_at_mut(spec.input * spec.output + spec.output);
            let (weights, _biases) = layer.split_at_mut(spec.input * spec.output);

            let weight_gen = self.weights.unwrap_or(ParamGen::XavierUniform {
                fan_in: spec.input,
                fan_out: spec.output,
            });
            weight_gen.fill(&mut rng, weights)?;
            rest = tail;
        }

        ModelArtifact::new(header, params)
    }

    /// Builds the artifact with the given parameters.
    pub fn build_with(&self, params: Vec<f32>) -> Result<ModelArtifact> {
        ModelArtifact::new(self.header()?, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> ModelArtifact {
        let input = ImageConstraint::new(4, 4, PixelFormat::Gray8);
        ArtifactBuilder::new(input, ["happy", "sad"])
            .pooling_grid(2, 2)
            .build(3)
            .unwrap()
    }

    #[test]
    fn codec_keeps_header_and_params() {
        let artifact = tiny();
        let decoded = ModelArtifact::from_bytes(&artifact.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.header(), artifact.header());
        assert_eq!(decoded.params(), artifact.params());
    }

    #[test]
    fn truncation_and_bad_magic_are_corrupt() {
        let bytes = tiny().to_bytes().unwrap();

        let truncated = ModelArtifact::from_bytes(&bytes[..bytes.len() - 1]);
        assert!(matches!(truncated, Err(PersonalizeErr::CorruptArtifact(_))));

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        let bad_magic = ModelArtifact::from_bytes(&bad_magic);
        assert!(matches!(bad_magic, Err(PersonalizeErr::CorruptArtifact(_))));

        let empty = ModelArtifact::from_bytes(&[]);
        assert!(matches!(empty, Err(PersonalizeErr::CorruptArtifact(_))));
    }

    #[test]
    fn label_expansion_keeps_existing_logits() {
        let artifact = tiny();
        let features = [0.1, 0.9, 0.4, 0.7];

        let expanded = artifact.with_label("surprised").unwrap();
        let before = artifact.logits(&features).unwrap();
        let after = expanded.logits(&features).unwrap();

        assert_eq!(expanded.labels(), ["happy", "sad", "surprised"]);
        assert_eq!(after.len(), 3);
        for (b, a) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(after[2], 0.);
        assert_eq!(expanded.revision(), artifact.revision());
    }

    #[test]
    fn revisions_increment() {
        let artifact = tiny();
        let revised = artifact.revised(artifact.params().to_vec()).unwrap();
        assert_eq!(revised.revision(), artifact.revision() + 1);
    }

    #[test]
    fn inconsistent_headers_are_rejected() {
        let artifact = tiny();
        let mut header = artifact.header().clone();
        header.labels.push("neutral".into());

        let err = ModelArtifact::new(header, artifact.params().to_vec()).unwrap_err();
        assert!(matches!(err, PersonalizeErr::CorruptArtifact(_)));
    }

    fn framed(header: &ArtifactHeader, payload: &[u8]) -> Vec<u8> {
        let header = serde_json::to_vec(header).unwrap();
        let mut buf = MAGIC.to_vec();
        buf.extend_from_slice(&(header.len() as HeaderLen).to_be_bytes());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn oversized_parameter_counts_are_corrupt() {
        let mut header = tiny().header().clone();
        header.param_count = (1 << 62) + 1;

        let decoded = ModelArtifact::from_bytes(&framed(&header, &[0; 4]));
        assert!(matches!(decoded, Err(PersonalizeErr::CorruptArtifact(_))));
    }

    #[test]
    fn overflowing_topologies_are_corrupt() {
        let mut header = tiny().header().clone();
        header.input = ImageConstraint::new(u32::MAX, u32::MAX, PixelFormat::Rgb8);
        header.pooling_grid = (u32::MAX, u32::MAX);
        header.param_count = 1;
        let decoded = ModelArtifact::from_bytes(&framed(&header, &[0; 4]));
        assert!(matches!(decoded, Err(PersonalizeErr::CorruptArtifact(_))));

        let mut header = tiny().header().clone();
        header.layers[0].input = usize::MAX;
        header.param_count = 1;
        let decoded = ModelArtifact::from_bytes(&framed(&header, &[0; 4]));
        assert!(matches!(decoded, Err(PersonalizeErr::CorruptArtifact(_))));
    }

    #[test]
    fn weights_can_be_drawn_from_other_generators() {
        let input = ImageConstraint::new(4, 4, PixelFormat::Gray8);
        let builder = ArtifactBuilder::new(input, ["happy", "sad"]).pooling_grid(2, 2);

        let constant = builder.clone().weight_init(ParamGen::Const(0.5)).build(0).unwrap();
        let (weights, biases) = constant.params().split_at(4 * 2);
        assert!(weights.iter().all(|&w| w == 0.5));
        assert!(biases.iter().all(|&b| b == 0.));

        let normal = builder
            .clone()
            .weight_init(ParamGen::Normal {
                mean: 0.,
                std_dev: 0.1,
            })
            .build(0)
            .unwrap();
        assert!(normal.params()[..8].iter().any(|&w| w != 0.));

        let err = builder
            .weight_init(ParamGen::Uniform { low: 1., high: 0. })
            .build(0)
            .unwrap_err();
        assert!(matches!(err, PersonalizeErr::Ml(_)));
    }

    #[test]
    fn predictions_are_probabilities() {
        let probs = tiny().predict(&[0.5; 4]).unwrap();
        assert_eq!(probs.len(), 2);
        assert!((probs.iter().sum::<f32>() - 1.).abs() < 1e-5);
    }
}
