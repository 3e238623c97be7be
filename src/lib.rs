#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]

//! # XPrize Instance Embeddings
//!
//! Per-instance feature vectors for segmented tree crowns in aerial forest
//! tiles, computed with a frozen DINOv2 (with registers) backbone.
//!
//! Each tile is normalized and zero-padded to the 14-pixel patch grid, the
//! backbone's patch tokens are reshaped into a feature grid, and every
//! instance mask is reduced to patch occupancy. An instance's embedding is
//! the mean of the patch features its mask covers.
//!
//! ## Features
//!
//! - **Two Backends**: ONNX Runtime (CUDA/`CoreML`/CPU) and Tract (pure Rust)
//! - **COCO Input**: polygon, RLE and compressed RLE segmentations
//! - **Model Management**: automatic download and caching from `HuggingFace`
//! - **Prefetching Loader**: batches are assembled on a background thread
//! - **CLI Integration**: optional `xprize-embed` binary (`cli` feature)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use xprize_embed::{
//!     load_backbone, BackendType, CocoSegmentationDataset, DinoV2Inference,
//!     DinoV2InferConfig, DinoV2Size, ModelDownloader, ModelManager, ModelSource,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let size = DinoV2Size::Base;
//! let downloader = ModelDownloader::new()?;
//! let model_id = downloader
//!     .download_model(&xprize_embed::models::default_model_url(size), true)
//!     .await?;
//!
//! let config = DinoV2InferConfig::builder().size(size).build()?;
//! let manager = ModelManager::from_source(ModelSource::Downloaded(model_id), size)?;
//! let backbone = load_backbone(BackendType::Onnx, &manager, &config)?;
//!
//! let dataset = Arc::new(CocoSegmentationDataset::open("tiles/coco.json", "tiles")?);
//! let results = DinoV2Inference::new(backbone.as_ref(), config)?.infer(dataset)?;
//! results.write_jsonl("out/embeddings.jsonl")?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `onnx` (default): ONNX Runtime backend with GPU acceleration support
//! - `tract` (default): Pure Rust backend
//! - `cli` (default): Command-line interface and progress bars
//! - `tracing-json`: JSON log output for the CLI

pub mod backends;
pub mod cache;
#[cfg(feature = "cli")]
pub mod cli;
pub mod coco;
pub mod config;
pub mod dataset;
pub mod download;
pub mod error;
pub mod inference;
pub mod masks;
pub mod models;
pub mod pipeline;
pub mod pooling;
pub mod preprocessing;
pub mod progress;
pub mod tracing_config;
pub mod types;

pub use backends::{load_backbone, parse_provider_string, BackendType};
pub use cache::{format_size, CachedModelInfo, ModelCache};
pub use coco::CocoSegmentationDataset;
pub use config::{
    DinoV2InferConfig, DinoV2InferIoConfig, DinoV2Size, EmbedderInferIoConfig, ExecutionProvider,
    NormalizationProfile, XPrizeIoConfig,
};
pub use dataset::{
    collate_segmentation, Batch, BatchLoader, InMemoryDataset, InstanceLabels, LabeledDataset,
    Sample,
};
pub use download::{parse_huggingface_url, validate_model_url, ModelDownloader};
pub use error::{EmbedError, Result};
pub use inference::{BackboneOutput, ExtractionMode, FeatureBackbone, FeatureExtractor, Features};
pub use masks::MaskAligner;
pub use models::{ModelInfo, ModelManager, ModelSource};
pub use pipeline::DinoV2Inference;
pub use pooling::{masked_average, masked_average_batch};
pub use preprocessing::{PaddingSpec, PatchGridDims, PatchGridPreprocessor};
pub use progress::{BatchProgress, ConsoleProgressReporter, NoOpProgressReporter, ProgressReporter};
pub use types::{ResultRecord, ResultSet};

#[cfg(feature = "cli")]
pub use progress::IndicatifProgressReporter;
pub use tracing_config::{spans, TracingConfig, TracingFormat};
