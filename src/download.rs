//! Fetching DINOv2 ONNX exports from `HuggingFace`
//!
//! Files are streamed into a hidden staging folder which is moved into the cache
//! only once every file arrived, so a cancelled download never leaves a
//! half-written model behind.

use crate::cache::ModelCache;
use crate::error::{EmbedError, Result};
use crate::models::ONNX_MODEL_FILE;
use futures_util::stream::TryStreamExt;
#[cfg(feature = "cli")]
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;

const HF_PREFIX: &str = "https://huggingface.co/";

/// Files fetched for every model, relative to the repository root
const MODEL_FILES: &[&str] = &["config.json", ONNX_MODEL_FILE];

/// Progress bar abstraction that works with and without CLI features
#[derive(Debug)]
pub enum ProgressIndicator {
    #[cfg(feature = "cli")]
    Indicatif(ProgressBar),
    NoOp,
}

impl ProgressIndicator {
    fn new(show: bool) -> Self {
        #[cfg(feature = "cli")]
        if show {
            let pb = ProgressBar::new(0);
            if let Ok(style) = ProgressStyle::default_bar().template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
            ) {
                pb.set_style(style.progress_chars("#>-"));
            }
            return Self::Indicatif(pb);
        }
        let _ = show;
        Self::NoOp
    }

    pub fn set_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_message(msg),
            Self::NoOp => {},
        }
    }

    pub fn set_length(&self, len: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_length(len),
            Self::NoOp => {},
        }
    }

    pub fn set_position(&self, pos: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_position(pos),
            Self::NoOp => {},
        }
    }

    pub fn finish_with_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.finish_with_message(msg),
            Self::NoOp => {},
        }
    }
}

/// Model downloader with progress reporting
#[derive(Debug)]
pub struct ModelDownloader {
    client: Client,
    cache: ModelCache,
}

impl ModelDownloader {
    /// Create a downloader writing into the default cache
    ///
    /// # Errors
    /// - Failed to create HTTP client
    /// - Failed to initialize model cache
    pub fn new() -> Result<Self> {
        Self::with_cache(ModelCache::new()?)
    }

    /// Create a downloader writing into `cache`
    ///
    /// # Errors
    /// - Failed to create HTTP client
    pub fn with_cache(cache: ModelCache) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .build()
            .map_err(|e| EmbedError::network_error("Failed to create HTTP client", e))?;
        Ok(Self { client, cache })
    }

    #[must_use]
    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Download a model repository into the cache and return its model id
    ///
    /// Returns immediately when the model is already cached.
    ///
    /// # Errors
    /// - Invalid or unsupported URL
    /// - Network errors during download
    /// - File system errors while moving the model into the cache
    pub async fn download_model(&self, url: &str, show_progress: bool) -> Result<String> {
        validate_model_url(url)?;
        let model_id = ModelCache::url_to_model_id(url);

        if self.cache.is_model_cached(&model_id) {
            log::info!("Model already cached: {}", model_id);
            return Ok(model_id);
        }
        log::info!("Downloading {} as {}", url, model_id);

        let temp_dir = Self::create_temp_download_dir(self.cache.cache_dir(), &model_id)?;
        let final_dir = self.cache.get_model_path(&model_id);
        let progress = ProgressIndicator::new(show_progress);

        let raw_base = format!("{}/resolve/main/", url.trim_end_matches('/'));
        let mut outcome = Ok(());
        for file_name in MODEL_FILES {
            progress.set_message(format!("Downloading {}", file_name));
            outcome = self
                .download_file(
                    &format!("{}{}", raw_base, file_name),
                    &temp_dir.join(file_name),
                    &progress,
                )
                .await;
            if outcome.is_err() {
                break;
            }
        }

        if let Err(e) = outcome {
            if let Err(cleanup_err) = fs::remove_dir_all(&temp_dir) {
                log::warn!("Failed to cleanup temp directory: {}", cleanup_err);
            }
            progress.finish_with_message("Download failed".to_string());
            return Err(e);
        }

        if final_dir.exists() {
            fs::remove_dir_all(&final_dir).map_err(|e| {
                EmbedError::file_io_error("remove existing model directory", &final_dir, &e)
            })?;
        }
        fs::rename(&temp_dir, &final_dir).map_err(|e| {
            EmbedError::file_io_error("move downloaded model to cache", &final_dir, &e)
        })?;

        progress.finish_with_message(format!("Downloaded {}", model_id));
        log::info!("Cached model {} in {}", model_id, final_dir.display());
        Ok(model_id)
    }

    /// Hidden staging folder inside the cache directory
    fn create_temp_download_dir(cache_dir: &Path, model_id: &str) -> Result<PathBuf> {
        let temp_dir = cache_dir.join(format!(".{}.partial", model_id));
        if temp_dir.exists() {
            fs::remove_dir_all(&temp_dir).map_err(|e| {
                EmbedError::file_io_error("remove existing temp directory", &temp_dir, &e)
            })?;
        }
        fs::create_dir_all(&temp_dir)
            .map_err(|e| EmbedError::file_io_error("create temp directory", &temp_dir, &e))?;
        Ok(temp_dir)
    }

    async fn download_file(
        &self,
        url: &str,
        local_path: &Path,
        progress: &ProgressIndicator,
    ) -> Result<()> {
        log::debug!("Downloading: {} -> {}", url, local_path.display());

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| EmbedError::file_io_error("create directory", parent, &e))?;
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EmbedError::network_error(format!("Failed to download {}", url), e))?;

        if !response.status().is_success() {
            return Err(EmbedError::network_error(
                format!("HTTP error for {}", url),
                response.status(),
            ));
        }

        let total_size = response.content_length();
        if let Some(total) = total_size {
            progress.set_length(total);
        }

        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| EmbedError::file_io_error("create file", local_path, &e))?;
        let mut stream = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let mut downloaded = 0u64;
        let mut buffer = vec![0; 64 * 1024];
        loop {
            let bytes_read = tokio::io::AsyncReadExt::read(&mut stream, &mut buffer)
                .await
                .map_err(|e| EmbedError::network_error("Failed to read download stream", e))?;
            if bytes_read == 0 {
                break;
            }

            file.write_all(buffer.get(..bytes_read).unwrap_or(&[]))
                .await
                .map_err(|e| EmbedError::file_io_error("write to file", local_path, &e))?;
            downloaded += bytes_read as u64;
            progress.set_position(downloaded);
        }

        file.flush()
            .await
            .map_err(|e| EmbedError::file_io_error("flush file", local_path, &e))?;
        log::debug!("Downloaded {} bytes to {}", downloaded, local_path.display());
        Ok(())
    }
}

/// Validate that a URL names a `HuggingFace` repository
///
/// # Errors
/// - `InvalidConfig` for empty, non-`HuggingFace` or incomplete URLs
pub fn validate_model_url(url: &str) -> Result<()> {
    parse_huggingface_url(url).map(|_| ())
}

/// Split a `HuggingFace` URL into `(owner, repository)`
///
/// # Errors
/// - `InvalidConfig` for empty, non-`HuggingFace` or incomplete URLs
pub fn parse_huggingface_url(url: &str) -> Result<(String, String)> {
    if url.is_empty() {
        return Err(EmbedError::invalid_config("Model URL cannot be empty"));
    }
    let repo_path = url.strip_prefix(HF_PREFIX).ok_or_else(|| {
        EmbedError::invalid_config(format!(
            "Unsupported URL format: {}. Only HuggingFace repositories are supported",
            url
        ))
    })?;

    let mut parts = repo_path.split('/').filter(|p| !p.is_empty());
    match (parts.next(), parts.next()) {
        (Some(owner), Some(repo)) => Ok((owner.to_string(), repo.to_string())),
        _ => Err(EmbedError::invalid_config(format!(
            "Invalid HuggingFace repository URL: {}. Expected https://huggingface.co/owner/repo",
            url
        ))),
    }
}
