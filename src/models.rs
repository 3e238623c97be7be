//! DINOv2 model resolution and metadata

use crate::{
    cache::ModelCache,
    config::{DinoV2Size, DINOV2_PATCH_SIZE, DINOV2_REGISTER_TOKENS},
    error::{EmbedError, Result},
};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Relative location of the ONNX graph inside a `HuggingFace` model folder
pub const ONNX_MODEL_FILE: &str = "onnx/model.onnx";

/// Where a model is loaded from
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ModelSource {
    /// ONNX file, or model folder containing `onnx/model.onnx`
    External(PathBuf),
    /// Downloaded model from cache by model ID
    Downloaded(String),
}

impl ModelSource {
    /// Get a display name for tracing and logging
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            ModelSource::External(path) => {
                format!(
                    "external:{}",
                    path.file_name().unwrap_or_default().to_string_lossy()
                )
            },
            ModelSource::Downloaded(model_id) => format!("cached:{}", model_id),
        }
    }

    /// Default cached source for a backbone size
    #[must_use]
    pub fn default_for(size: DinoV2Size) -> Self {
        Self::Downloaded(ModelCache::url_to_model_id(&default_model_url(size)))
    }
}

/// `HuggingFace` repository holding the ONNX export of a DINOv2-with-registers checkpoint
#[must_use]
pub fn default_model_url(size: DinoV2Size) -> String {
    format!(
        "https://huggingface.co/onnx-community/dinov2-with-registers-{}",
        size.as_str()
    )
}

/// Model information and metadata
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub size: DinoV2Size,
    pub size_bytes: u64,
    pub embedding_dim: usize,
    pub patch_size: usize,
    pub register_tokens: usize,
}

/// Subset of a `HuggingFace` `config.json` used to cross-check the checkpoint
#[derive(Debug, Deserialize)]
struct HfModelConfig {
    hidden_size: Option<usize>,
    patch_size: Option<usize>,
    num_register_tokens: Option<usize>,
}

/// Resolves a model source to ONNX bytes and metadata
#[derive(Debug)]
pub struct ModelManager {
    source: ModelSource,
    size: DinoV2Size,
    model_path: PathBuf,
    info: ModelInfo,
}

impl ModelManager {
    /// Resolve `source` for a backbone of the given size
    ///
    /// # Errors
    /// - `ModelLoadFailure` if the model file does not exist
    /// - `ModelLoadFailure` if the folder's `config.json` disagrees with `size`
    pub fn from_source(source: ModelSource, size: DinoV2Size) -> Result<Self> {
        let model_path = match &source {
            ModelSource::External(path) => Self::resolve_external(path)?,
            ModelSource::Downloaded(model_id) => {
                let cache = ModelCache::new()?;
                if !cache.is_model_cached(model_id) {
                    return Err(EmbedError::model_load(format!(
                        "model '{}' is not cached in {}. Download it first with --download-only",
                        model_id,
                        cache.cache_dir().display()
                    )));
                }
                cache.get_model_path(model_id).join(ONNX_MODEL_FILE)
            },
        };

        let info = Self::read_info(&model_path, &source, size)?;
        log::debug!(
            "Resolved {} to {} ({} bytes)",
            source.display_name(),
            model_path.display(),
            info.size_bytes
        );

        Ok(Self {
            source,
            size,
            model_path,
            info,
        })
    }

    fn resolve_external(path: &Path) -> Result<PathBuf> {
        let candidate = if path.is_dir() {
            path.join(ONNX_MODEL_FILE)
        } else {
            path.to_path_buf()
        };
        if candidate.is_file() {
            Ok(candidate)
        } else {
            Err(EmbedError::model_load(format!(
                "model file not found: {}",
                candidate.display()
            )))
        }
    }

    fn read_info(model_path: &Path, source: &ModelSource, size: DinoV2Size) -> Result<ModelInfo> {
        let size_bytes = fs::metadata(model_path)
            .map_err(|e| {
                EmbedError::model_load(format!("cannot stat {}: {}", model_path.display(), e))
            })?
            .len();

        let mut info = ModelInfo {
            name: size.hub_model_name(),
            size,
            size_bytes,
            embedding_dim: size.embedding_dim(),
            patch_size: DINOV2_PATCH_SIZE,
            register_tokens: DINOV2_REGISTER_TOKENS,
        };

        // Model folders carry a config.json next to onnx/
        let config_path = model_path
            .parent()
            .and_then(Path::parent)
            .map(|dir| dir.join("config.json"));
        if let Some(config_path) = config_path.filter(|p| p.is_file()) {
            let content = fs::read_to_string(&config_path)
                .map_err(|e| EmbedError::file_io_error("read model config", &config_path, &e))?;
            let hf: HfModelConfig = serde_json::from_str(&content)?;

            if let Some(hidden) = hf.hidden_size {
                if hidden != info.embedding_dim {
                    return Err(EmbedError::model_load(format!(
                        "{} has hidden size {} but DINOv2 '{}' expects {}",
                        source.display_name(),
                        hidden,
                        size,
                        info.embedding_dim
                    )));
                }
            }
            if let Some(patch) = hf.patch_size {
                info.patch_size = patch;
            }
            if let Some(registers) = hf.num_register_tokens {
                info.register_tokens = registers;
            }
        }

        Ok(info)
    }

    /// Load model data
    ///
    /// # Errors
    /// - `ModelLoadFailure` if the file cannot be read
    pub fn load_model(&self) -> Result<Vec<u8>> {
        fs::read(&self.model_path).map_err(|e| {
            EmbedError::model_load(format!(
                "failed to read {}: {}",
                self.model_path.display(),
                e
            ))
        })
    }

    #[must_use]
    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    #[must_use]
    pub fn size(&self) -> DinoV2Size {
        self.size
    }

    #[must_use]
    pub fn source(&self) -> &ModelSource {
        &self.source
    }

    #[must_use]
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}
