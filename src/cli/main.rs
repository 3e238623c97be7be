//! XPrize embedding CLI
//!
//! Embeds every labeled instance of a COCO dataset with a DINOv2 backbone and
//! writes one JSON record per instance.

use super::config::{CliConfigBuilder, CliJob};
use crate::{
    backends::{load_backbone, BackendType},
    cache::{format_size, ModelCache},
    coco::CocoSegmentationDataset,
    config::DinoV2Size,
    dataset::LabeledDataset,
    download::ModelDownloader,
    models::{default_model_url, ModelManager, ModelSource},
    pipeline::DinoV2Inference,
    progress::IndicatifProgressReporter,
    tracing_config::{spans, TracingConfig, TracingFormat},
};
use anyhow::{Context, Result};
use clap::Parser;
use instant::Instant;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Name of the results file inside the output folder
pub const EMBEDDINGS_FILE: &str = "embeddings.jsonl";

/// DINOv2 instance embedding tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "xprize-embed")]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// JSON job description with `embedder.infer.io` and `embedder.infer.dino_v2` sections
    #[arg(long, value_name = "JSON")]
    pub config: Option<PathBuf>,

    /// COCO annotation file
    #[arg(long, value_name = "PATH")]
    pub coco: Option<PathBuf>,

    /// Folder the COCO `file_name` entries are relative to
    #[arg(long, value_name = "DIR")]
    pub tiles_root: Option<PathBuf>,

    /// Output folder for embeddings.jsonl
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Backbone size (small, base, large, giant)
    #[arg(long)]
    pub size: Option<String>,

    /// Normalization profile (imagenet, forest_qpeb, none)
    #[arg(long)]
    pub profile: Option<String>,

    /// Skip per-channel normalization
    #[arg(long)]
    pub no_normalize: bool,

    /// Normalize every image by its own statistics
    #[arg(long)]
    pub instance_normalization: bool,

    /// Use the class token of the whole image instead of masked patch averages
    #[arg(long)]
    pub whole_image: bool,

    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Loader threads decoding batches ahead of inference (0 = load inline)
    #[arg(long)]
    pub workers: Option<usize>,

    /// ONNX file or model folder to use instead of the cached download
    #[arg(short, long, value_name = "PATH")]
    pub model: Option<PathBuf>,

    /// Inference engine in format backend:provider (e.g., onnx:auto, onnx:cuda, tract:cpu)
    #[arg(short, long, default_value = "onnx:auto")]
    pub backend: String,

    /// Number of threads (0 = auto-detect)
    #[arg(short, long, default_value_t = 0)]
    pub threads: usize,

    /// Download the model for --size and exit
    #[arg(long)]
    pub download_only: bool,

    /// List cached models and exit
    #[arg(long)]
    pub list_models: bool,

    /// Show available backends and execution providers and exit
    #[arg(long)]
    pub show_providers: bool,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    TracingConfig::new()
        .with_verbosity(cli.verbose)
        .with_format(TracingFormat::Console)
        .init()
        .context("Failed to initialize tracing")?;

    if cli.show_providers {
        show_provider_diagnostics();
        return Ok(());
    }

    if cli.list_models {
        return list_cached_models();
    }

    if cli.download_only {
        let size = match &cli.size {
            Some(size) => size.parse()?,
            None => DinoV2Size::Base,
        };
        let model_id = ensure_model_available(&ModelSource::default_for(size), &default_model_url(size))
            .await?;
        info!("Model '{}' is ready", model_id);
        return Ok(());
    }

    let CliJob {
        job,
        backend,
        model_source,
    } = CliConfigBuilder::from_cli(&cli).context("Invalid arguments")?;

    let _session = spans::session(&model_source.display_name(), &cli.backend).entered();
    debug!(config = %job.to_structured_value(), "Resolved job");

    ensure_model_available(&model_source, &default_model_url(job.model.size)).await?;

    let manager = ModelManager::from_source(model_source, job.model.size)
        .context("Failed to resolve model")?;
    let backbone = {
        let _span = spans::model_loading(&manager.info().name, &backend.to_string()).entered();
        load_backbone(backend, &manager, &job.model).context("Failed to load backbone")?
    };

    let dataset: Arc<dyn LabeledDataset> = {
        let _span = spans::dataset_loading(&job.io.coco_path).entered();
        Arc::new(
            CocoSegmentationDataset::open(&job.io.coco_path, &job.io.input_tiles_root)
                .context("Failed to open COCO dataset")?,
        )
    };
    if dataset.is_empty() {
        log::warn!("{} contains no labeled tiles", job.io.coco_path.display());
    }

    let start = Instant::now();
    let driver = DinoV2Inference::new(backbone.as_ref(), job.model.clone())?
        .with_progress_reporter(Box::new(IndicatifProgressReporter::new()));
    let results = driver.infer(dataset).context("Inference failed")?;

    std::fs::create_dir_all(&job.io.output_folder).with_context(|| {
        format!(
            "Failed to create output folder {}",
            job.io.output_folder.display()
        )
    })?;
    let output = job.io.output_folder.join(EMBEDDINGS_FILE);
    results
        .write_jsonl(&output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    info!(
        "Embedded {} instances in {:.2}s on {} -> {}",
        results.len(),
        start.elapsed().as_secs_f64(),
        match backend {
            BackendType::Onnx => "ONNX Runtime",
            BackendType::Tract => "Tract",
        },
        output.display()
    );
    Ok(())
}

/// Download the default checkpoint when a cached source is missing
///
/// External sources are returned untouched.
async fn ensure_model_available(source: &ModelSource, url: &str) -> Result<String> {
    let ModelSource::Downloaded(model_id) = source else {
        return Ok(source.display_name());
    };

    let cache = ModelCache::new().context("Failed to create model cache")?;
    if cache.is_model_cached(model_id) {
        debug!(model_id = %model_id, "Model already cached");
        return Ok(model_id.clone());
    }

    let _span = spans::download(url).entered();
    info!("Model '{}' not cached, downloading from {}", model_id, url);
    let downloader = ModelDownloader::with_cache(cache).context("Failed to create downloader")?;
    let downloaded = downloader
        .download_model(url, true)
        .await
        .context("Failed to download model")?;
    if downloaded != *model_id {
        anyhow::bail!(
            "Downloaded model ID '{}' doesn't match expected '{}'",
            downloaded,
            model_id
        );
    }
    Ok(downloaded)
}

fn show_provider_diagnostics() {
    let mut backends: Vec<(&str, Vec<(String, bool, String)>)> = Vec::new();
    #[cfg(feature = "onnx")]
    backends.push(("onnx", crate::backends::OnnxBackbone::list_providers()));
    #[cfg(feature = "tract")]
    backends.push(("tract", crate::backends::TractBackbone::list_providers()));

    if backends.is_empty() {
        println!("No inference backend is compiled in. Rebuild with --features onnx or tract.");
        return;
    }
    for (backend, providers) in backends {
        println!("{backend}:");
        for (name, available, description) in providers {
            let status = if available { "available" } else { "not available" };
            println!("  {name:<8} {status:<14} {description}");
        }
    }
    println!("\nSelect with --backend backend:provider, e.g. onnx:cuda or tract:cpu");
}

fn list_cached_models() -> Result<()> {
    let cache = ModelCache::new().context("Failed to initialize model cache")?;
    let models = cache
        .scan_cached_models()
        .context("Failed to list cached models")?;

    println!("Cache directory: {}", cache.cache_dir().display());
    if models.is_empty() {
        println!("No cached models found. Use --download-only --size <SIZE> to fetch one.");
        return Ok(());
    }
    for model in models {
        println!(
            "{}  {}{}",
            model.model_id,
            format_size(model.size_bytes),
            if model.has_config { "" } else { "  (no config.json)" }
        );
    }
    Ok(())
}
