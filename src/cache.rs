//! Model cache management for downloaded backbones
//!
//! Downloaded models live in an XDG-compliant cache directory, one folder per
//! model id, each holding `config.json` and `onnx/model.onnx`.

use crate::error::{EmbedError, Result};
use crate::models::ONNX_MODEL_FILE;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the cache location
pub const CACHE_DIR_ENV: &str = "XPRIZE_EMBED_CACHE_DIR";

/// Information about a cached model
#[derive(Debug, Clone)]
pub struct CachedModelInfo {
    pub model_id: String,
    pub path: PathBuf,
    pub has_config: bool,
    pub size_bytes: u64,
}

/// Model cache manager
#[derive(Debug, Clone)]
pub struct ModelCache {
    cache_dir: PathBuf,
}

impl ModelCache {
    /// Create a model cache manager at the default location
    ///
    /// - Linux/macOS: `~/.cache/xprize-embed/models/`
    /// - Windows: `%LOCALAPPDATA%/xprize-embed/models/`
    ///
    /// # Errors
    /// - Failed to determine or create the cache directory
    pub fn new() -> Result<Self> {
        let cache_dir = Self::default_cache_dir()?;
        Self::ensure_dir(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    /// Create a model cache rooted at a custom directory
    ///
    /// # Errors
    /// - Failed to create the cache directory
    pub fn with_custom_cache_dir(cache_dir: &Path) -> Result<Self> {
        let models_dir = cache_dir.join("models");
        Self::ensure_dir(&models_dir)?;
        Ok(Self {
            cache_dir: models_dir,
        })
    }

    fn ensure_dir(dir: &Path) -> Result<()> {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .map_err(|e| EmbedError::file_io_error("create cache directory", dir, &e))?;
        }
        Ok(())
    }

    fn default_cache_dir() -> Result<PathBuf> {
        if let Ok(cache_override) = std::env::var(CACHE_DIR_ENV) {
            return Ok(PathBuf::from(cache_override).join("models"));
        }

        Ok(dirs::cache_dir()
            .ok_or_else(|| {
                EmbedError::invalid_config(format!(
                    "Failed to determine cache directory. Set {CACHE_DIR_ENV} environment variable."
                ))
            })?
            .join("xprize-embed")
            .join("models"))
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Generate a model ID from a URL
    ///
    /// ```
    /// use xprize_embed::cache::ModelCache;
    ///
    /// let id = ModelCache::url_to_model_id("https://huggingface.co/onnx-community/dinov2-with-registers-base");
    /// assert_eq!(id, "onnx-community--dinov2-with-registers-base");
    /// ```
    #[must_use]
    pub fn url_to_model_id(url: &str) -> String {
        let prefix = "https://huggingface.co/";
        if let Some(path) = url.strip_prefix(prefix) {
            path.trim_end_matches('/').replace('/', "--")
        } else {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(url.as_bytes());
            let hash_string = format!("url-{:x}", hasher.finalize());
            hash_string.get(..16).unwrap_or(&hash_string).to_string()
        }
    }

    /// `true` if the model folder exists and holds an ONNX graph
    #[must_use]
    pub fn is_model_cached(&self, model_id: &str) -> bool {
        !model_id.is_empty() && self.get_model_path(model_id).join(ONNX_MODEL_FILE).is_file()
    }

    /// Path to a cached model directory (may not exist)
    #[must_use]
    pub fn get_model_path(&self, model_id: &str) -> PathBuf {
        self.cache_dir.join(model_id)
    }

    /// List all valid cached models, sorted by id
    ///
    /// # Errors
    /// - Failed to read the cache directory
    pub fn scan_cached_models(&self) -> Result<Vec<CachedModelInfo>> {
        let mut models = Vec::new();
        if !self.cache_dir.exists() {
            return Ok(models);
        }

        let entries = fs::read_dir(&self.cache_dir).map_err(|e| {
            EmbedError::file_io_error("read cache directory", &self.cache_dir, &e)
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(model_id) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // Hidden entries are in-progress downloads
            if model_id.starts_with('.') || !path.is_dir() || !self.is_model_cached(model_id) {
                log::debug!("Skipping invalid model directory: {}", path.display());
                continue;
            }
            models.push(CachedModelInfo {
                model_id: model_id.to_string(),
                has_config: path.join("config.json").is_file(),
                size_bytes: directory_size(&path).unwrap_or(0),
                path,
            });
        }

        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(models)
    }
}

fn directory_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            total += directory_size(&path)?;
        } else {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Format bytes as a human-readable string
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS.get(unit).unwrap_or(&"GB"))
    }
}
