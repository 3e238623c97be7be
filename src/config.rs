//! Configuration types for DINOv2 embedding inference
//!
//! Configuration files are JSON documents using the nested layout shared with
//! the rest of the XPrize pipeline:
//!
//! ```json
//! {
//!   "embedder": {
//!     "infer": {
//!       "io": { "input_tiles_root": "...", "coco_path": "...", "output_folder": "..." },
//!       "dino_v2": { "size": "base" }
//!     }
//!   }
//! }
//! ```

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Side length in pixels of one DINOv2 input patch
pub const DINOV2_PATCH_SIZE: usize = 14;

/// Number of register tokens emitted by the `_reg` DINOv2 checkpoints
pub const DINOV2_REGISTER_TOKENS: usize = 4;

/// Per-channel ImageNet statistics
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Placeholder per-channel statistics for the forest tile corpus (RGB, [0, 1] range)
///
/// These are fixed values, not statistics fitted on the tiles.
pub const FOREST_QPEB_MEAN: [f32; 3] = [0.403, 0.464, 0.363];
pub const FOREST_QPEB_STD: [f32; 3] = [0.187, 0.178, 0.166];

/// DINOv2 backbone size class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DinoV2Size {
    Small,
    Base,
    Large,
    Giant,
}

impl DinoV2Size {
    pub const ALL: [Self; 4] = [Self::Small, Self::Base, Self::Large, Self::Giant];

    /// Feature dimension of the backbone's output tokens
    #[must_use]
    pub fn embedding_dim(self) -> usize {
        match self {
            Self::Small => 384,
            Self::Base => 768,
            Self::Large => 1024,
            Self::Giant => 1536,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Base => "base",
            Self::Large => "large",
            Self::Giant => "giant",
        }
    }

    /// Hub name of the checkpoint, e.g. `dinov2_vitb14_reg`
    #[must_use]
    pub fn hub_model_name(self) -> String {
        let initial = self.as_str().chars().next().unwrap_or('s');
        format!("dinov2_vit{initial}{DINOV2_PATCH_SIZE}_reg")
    }
}

impl FromStr for DinoV2Size {
    type Err = EmbedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Ok(Self::Small),
            "base" => Ok(Self::Base),
            "large" => Ok(Self::Large),
            "giant" => Ok(Self::Giant),
            _ => Err(EmbedError::unsupported_model_size(format!(
                "'{}'. Valid values are [small, base, large, giant]",
                s
            ))),
        }
    }
}

impl std::fmt::Display for DinoV2Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed mean/std profile used for dataset-level normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationProfile {
    #[serde(rename = "imagenet")]
    ImageNet,
    ForestQpeb,
    /// Explicitly disables profile normalization
    None,
}

impl NormalizationProfile {
    /// Per-channel (mean, std), or `None` for the no-op profile
    #[must_use]
    pub fn mean_std(self) -> Option<([f32; 3], [f32; 3])> {
        match self {
            Self::ImageNet => Some((IMAGENET_MEAN, IMAGENET_STD)),
            Self::ForestQpeb => Some((FOREST_QPEB_MEAN, FOREST_QPEB_STD)),
            Self::None => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ImageNet => "imagenet",
            Self::ForestQpeb => "forest_qpeb",
            Self::None => "none",
        }
    }
}

impl FromStr for NormalizationProfile {
    type Err = EmbedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "imagenet" => Ok(Self::ImageNet),
            "forest_qpeb" => Ok(Self::ForestQpeb),
            "none" => Ok(Self::None),
            _ => Err(EmbedError::invalid_profile(format!(
                "'{}'. Valid values are [imagenet, forest_qpeb, none]",
                s
            ))),
        }
    }
}

impl std::fmt::Display for NormalizationProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution provider options for ONNX Runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    /// Auto-detect best available provider (CUDA > `CoreML` > CPU)
    #[default]
    Auto,
    /// CPU execution (always available)
    Cpu,
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// Apple Silicon acceleration
    CoreMl,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_profile() -> String {
    NormalizationProfile::ImageNet.as_str().to_string()
}

fn default_batch_size() -> usize {
    1
}

fn default_num_workers() -> usize {
    3
}

/// Model and inference parameters of the DINOv2 embedder
///
/// `mean_std_descriptor` is kept as the raw string from the configuration
/// file so that an unknown profile surfaces as `InvalidProfile` when the
/// preprocessor is built, not as a generic deserialization failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct DinoV2InferConfig {
    pub size: DinoV2Size,
    #[serde(default = "default_true")]
    pub normalize: bool,
    #[serde(default)]
    pub instance_normalization: bool,
    #[serde(default = "default_profile")]
    pub mean_std_descriptor: String,
    #[serde(default = "default_true")]
    pub average_non_masked_patches: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Loader threads decoding batches ahead of inference (0 = load inline)
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default)]
    pub execution_provider: ExecutionProvider,
    /// Number of intra-op threads for inference (0 = auto)
    #[serde(default)]
    pub intra_threads: usize,
    /// Number of inter-op threads for inference (0 = auto)
    #[serde(default)]
    pub inter_threads: usize,
}

impl Default for DinoV2InferConfig {
    fn default() -> Self {
        Self {
            size: DinoV2Size::Base,
            normalize: true,
            instance_normalization: false,
            mean_std_descriptor: default_profile(),
            average_non_masked_patches: true,
            batch_size: default_batch_size(),
            num_workers: default_num_workers(),
            execution_provider: ExecutionProvider::Auto,
            intra_threads: 0,
            inter_threads: 0,
        }
    }
}

impl DinoV2InferConfig {
    #[must_use]
    pub fn builder() -> DinoV2InferConfigBuilder {
        DinoV2InferConfigBuilder::default()
    }

    /// Resolve the configured normalization profile
    ///
    /// # Errors
    /// - `InvalidProfile` when normalization is enabled with an unknown profile name
    pub fn profile(&self) -> Result<NormalizationProfile> {
        if !self.normalize {
            return Ok(NormalizationProfile::None);
        }
        self.mean_std_descriptor.parse()
    }

    /// Validate all configuration parameters
    ///
    /// # Errors
    /// - Batch size of zero
    /// - Unknown normalization profile while dataset-level normalization is active
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EmbedError::config_value_error(
                "batch size",
                self.batch_size,
                ">= 1",
                Some(default_batch_size()),
            ));
        }
        if self.normalize && !self.instance_normalization {
            self.profile()?;
        }
        Ok(())
    }

    /// Read the `embedder.infer.dino_v2` section of a structured config
    ///
    /// # Errors
    /// - Missing section or malformed values
    pub fn from_value(config: &Value) -> Result<Self> {
        let section = config
            .pointer("/embedder/infer/dino_v2")
            .ok_or_else(|| EmbedError::invalid_config("missing 'embedder.infer.dino_v2' section"))?;

        if let Some(size) = section.get("size").and_then(Value::as_str) {
            size.parse::<DinoV2Size>()?;
        }

        Ok(serde_json::from_value(section.clone())?)
    }

    #[must_use]
    pub fn to_structured_value(&self) -> Value {
        json!({
            "embedder": {
                "infer": {
                    "dino_v2": self,
                }
            }
        })
    }
}

/// Builder for `DinoV2InferConfig`
#[derive(Debug, Default)]
pub struct DinoV2InferConfigBuilder {
    config: DinoV2InferConfig,
}

impl DinoV2InferConfigBuilder {
    #[must_use]
    pub fn size(mut self, size: DinoV2Size) -> Self {
        self.config.size = size;
        self
    }

    #[must_use]
    pub fn normalize(mut self, normalize: bool) -> Self {
        self.config.normalize = normalize;
        self
    }

    #[must_use]
    pub fn instance_normalization(mut self, enabled: bool) -> Self {
        self.config.instance_normalization = enabled;
        self
    }

    #[must_use]
    pub fn mean_std_descriptor<S: Into<String>>(mut self, descriptor: S) -> Self {
        self.config.mean_std_descriptor = descriptor.into();
        self
    }

    #[must_use]
    pub fn average_non_masked_patches(mut self, enabled: bool) -> Self {
        self.config.average_non_masked_patches = enabled;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.config.num_workers = num_workers;
        self
    }

    #[must_use]
    pub fn execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.execution_provider = provider;
        self
    }

    #[must_use]
    pub fn num_threads(mut self, threads: usize) -> Self {
        self.config.intra_threads = threads;
        self.config.inter_threads = if threads > 0 { (threads / 2).max(1) } else { 0 };
        self
    }

    /// Build the configuration after validating it
    ///
    /// # Errors
    /// - See [`DinoV2InferConfig::validate`]
    pub fn build(self) -> Result<DinoV2InferConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Input and output locations of an embedding run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedderInferIoConfig {
    pub input_tiles_root: PathBuf,
    pub coco_path: PathBuf,
    pub output_folder: PathBuf,
}

impl EmbedderInferIoConfig {
    /// Read the `embedder.infer.io` section of a structured config
    ///
    /// # Errors
    /// - Missing section or malformed values
    pub fn from_value(config: &Value) -> Result<Self> {
        let section = config
            .pointer("/embedder/infer/io")
            .ok_or_else(|| EmbedError::invalid_config("missing 'embedder.infer.io' section"))?;
        Ok(serde_json::from_value(section.clone())?)
    }

    #[must_use]
    pub fn to_structured_value(&self) -> Value {
        json!({
            "embedder": {
                "infer": {
                    "io": self,
                }
            }
        })
    }
}

/// Complete description of a DINOv2 embedding job
#[derive(Debug, Clone, PartialEq)]
pub struct DinoV2InferIoConfig {
    pub io: EmbedderInferIoConfig,
    pub model: DinoV2InferConfig,
}

impl DinoV2InferIoConfig {
    /// # Errors
    /// - Missing or malformed `io` or `dino_v2` sections
    pub fn from_value(config: &Value) -> Result<Self> {
        Ok(Self {
            io: EmbedderInferIoConfig::from_value(config)?,
            model: DinoV2InferConfig::from_value(config)?,
        })
    }

    /// Load a job description from a JSON file
    ///
    /// # Errors
    /// - File cannot be read or parsed
    /// - Missing or malformed sections
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EmbedError::file_io_error("read config file", path, &e))?;
        let value: Value = serde_json::from_str(&content)?;
        let config = Self::from_value(&value)?;
        config.model.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn to_structured_value(&self) -> Value {
        let mut value = self.model.to_structured_value();
        if let Some(infer) = value.pointer_mut("/embedder/infer") {
            infer["io"] = json!(self.io);
        }
        value
    }
}

/// Raster-level parameters of the end-to-end XPrize job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XPrizeIo {
    pub raster_path: PathBuf,
    pub output_folder: PathBuf,
    pub coco_n_workers: usize,
}

/// End-to-end job description composing the sub-pipeline configurations
///
/// The tilerizer, detector, aggregator and segmenter sections belong to
/// other stages; they are carried verbatim so the composed document can be
/// validated and written back without loss.
#[derive(Debug, Clone, PartialEq)]
pub struct XPrizeIoConfig {
    pub io: XPrizeIo,
    pub tilerizer: Value,
    pub detector: Value,
    pub aggregator: Value,
    pub segmenter: Value,
}

impl XPrizeIoConfig {
    /// # Errors
    /// - Missing `io` section or any sub-pipeline section
    pub fn from_value(config: &Value) -> Result<Self> {
        let io = config
            .get("io")
            .ok_or_else(|| EmbedError::invalid_config("missing 'io' section"))?;
        let io: XPrizeIo = serde_json::from_value(io.clone())?;

        let section = |name: &str| {
            config
                .get(name)
                .cloned()
                .ok_or_else(|| EmbedError::invalid_config(format!("missing '{name}' section")))
        };

        Ok(Self {
            io,
            tilerizer: section("tilerizer")?,
            detector: section("detector")?,
            aggregator: section("aggregator")?,
            segmenter: section("segmenter")?,
        })
    }

    /// # Errors
    /// - File cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EmbedError::file_io_error("read config file", path, &e))?;
        Self::from_value(&serde_json::from_str(&content)?)
    }

    #[must_use]
    pub fn to_structured_value(&self) -> Value {
        json!({
            "io": self.io,
            "tilerizer": self.tilerizer,
            "detector": self.detector,
            "aggregator": self.aggregator,
            "segmenter": self.segmenter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_embedder_config() -> Value {
        json!({
            "embedder": {
                "infer": {
                    "io": {
                        "input_tiles_root": "/data/tiles",
                        "coco_path": "/data/coco.json",
                        "output_folder": "/data/out"
                    },
                    "dino_v2": { "size": "large" }
                }
            }
        })
    }

    #[test]
    fn test_size_parsing_and_dims() {
        assert_eq!("small".parse::<DinoV2Size>().unwrap(), DinoV2Size::Small);
        assert_eq!("GIANT".parse::<DinoV2Size>().unwrap(), DinoV2Size::Giant);
        assert!(matches!(
            "huge".parse::<DinoV2Size>(),
            Err(EmbedError::UnsupportedModelSize(_))
        ));

        let dims: Vec<usize> = DinoV2Size::ALL.iter().map(|s| s.embedding_dim()).collect();
        assert_eq!(dims, vec![384, 768, 1024, 1536]);
        assert_eq!(DinoV2Size::Base.hub_model_name(), "dinov2_vitb14_reg");
    }

    #[test]
    fn test_profile_parsing() {
        assert_eq!(
            "imagenet".parse::<NormalizationProfile>().unwrap(),
            NormalizationProfile::ImageNet
        );
        assert_eq!(
            "forest_qpeb".parse::<NormalizationProfile>().unwrap(),
            NormalizationProfile::ForestQpeb
        );
        assert!(NormalizationProfile::None.mean_std().is_none());
        assert_eq!(
            NormalizationProfile::ForestQpeb.mean_std(),
            Some((FOREST_QPEB_MEAN, FOREST_QPEB_STD))
        );
        assert_ne!(FOREST_QPEB_MEAN, IMAGENET_MEAN);
        assert!(matches!(
            "bogus".parse::<NormalizationProfile>(),
            Err(EmbedError::InvalidProfile(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_profile_only_when_used() {
        let config = DinoV2InferConfig {
            mean_std_descriptor: "bogus".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EmbedError::InvalidProfile(_))));

        let config = DinoV2InferConfig {
            normalize: false,
            ..config
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.profile().unwrap(), NormalizationProfile::None);
    }

    #[test]
    fn test_builder_rejects_zero_batch() {
        let result = DinoV2InferConfig::builder().batch_size(0).build();
        assert!(matches!(result, Err(EmbedError::InvalidConfig(_))));
    }

    #[test]
    fn test_nested_layout_round_trip() {
        let value = sample_embedder_config();
        let config = DinoV2InferIoConfig::from_value(&value).unwrap();
        assert_eq!(config.model.size, DinoV2Size::Large);
        assert_eq!(config.model.num_workers, 3);
        assert_eq!(config.io.coco_path, PathBuf::from("/data/coco.json"));

        let written = config.to_structured_value();
        assert_eq!(written["embedder"]["infer"]["dino_v2"]["size"], "large");
        assert_eq!(DinoV2InferIoConfig::from_value(&written).unwrap(), config);
    }

    #[test]
    fn test_unknown_size_in_config() {
        let mut value = sample_embedder_config();
        value["embedder"]["infer"]["dino_v2"]["size"] = json!("tiny");
        assert!(matches!(
            DinoV2InferConfig::from_value(&value),
            Err(EmbedError::UnsupportedModelSize(_))
        ));
    }

    #[test]
    fn test_xprize_config_composition() {
        let value = json!({
            "io": { "raster_path": "/r.tif", "output_folder": "/out", "coco_n_workers": 4 },
            "tilerizer": { "tile_size": 1024 },
            "detector": { "architecture": "fasterrcnn" },
            "aggregator": { "score_threshold": 0.5 },
            "segmenter": { "model_type": "vit_h" }
        });
        let config = XPrizeIoConfig::from_value(&value).unwrap();
        assert_eq!(config.io.coco_n_workers, 4);
        assert_eq!(config.detector["architecture"], "fasterrcnn");
        assert_eq!(config.to_structured_value(), value);

        let mut missing = value;
        missing.as_object_mut().unwrap().remove("segmenter");
        assert!(matches!(
            XPrizeIoConfig::from_value(&missing),
            Err(EmbedError::InvalidConfig(_))
        ));
    }
}
