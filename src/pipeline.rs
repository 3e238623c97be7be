//! Masked-patch embedding of labeled segmentation datasets
//!
//! Per batch the images are normalized and padded to the patch grid, run
//! through the backbone, and every instance mask is padded the same way and
//! reduced to patch occupancy. Per-patch features are then averaged over the
//! occupied patches of each instance.

use crate::config::DinoV2InferConfig;
use crate::dataset::{Batch, BatchLoader, LabeledDataset};
use crate::error::{EmbedError, Result};
use crate::inference::{ExtractionMode, FeatureBackbone, FeatureExtractor, Features};
use crate::masks::MaskAligner;
use crate::pooling::masked_average_batch;
use crate::preprocessing::PatchGridPreprocessor;
use crate::progress::{BatchProgress, NoOpProgressReporter, ProgressReporter};
use crate::types::{ResultRecord, ResultSet};
use instant::Instant;
use ndarray::{Array2, Axis};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug as trace_debug, info as trace_info, instrument, span, Level};

/// Drives a frozen backbone over a labeled dataset
pub struct DinoV2Inference<'a> {
    backbone: &'a dyn FeatureBackbone,
    preprocessor: PatchGridPreprocessor,
    aligner: MaskAligner,
    config: DinoV2InferConfig,
    reporter: Box<dyn ProgressReporter>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> DinoV2Inference<'a> {
    /// Bind a backbone to an inference configuration
    ///
    /// The normalization profile is resolved here, so an unknown profile
    /// fails before the backbone is ever invoked.
    ///
    /// # Errors
    /// - `InvalidProfile` for an unknown profile while profile normalization is on
    /// - `InvalidConfig` for a zero batch size
    pub fn new(backbone: &'a dyn FeatureBackbone, config: DinoV2InferConfig) -> Result<Self> {
        let patch_size = backbone.patch_size();
        let preprocessor = PatchGridPreprocessor::new(
            patch_size,
            config.normalize,
            config.instance_normalization,
            &config.mean_std_descriptor,
        )?;
        config.validate()?;

        if backbone.embedding_dim() != config.size.embedding_dim() {
            log::warn!(
                "Backbone {} produces {}-d tokens, DINOv2 '{}' would produce {}",
                backbone.name(),
                backbone.embedding_dim(),
                config.size,
                config.size.embedding_dim()
            );
        }

        Ok(Self {
            backbone,
            preprocessor,
            aligner: MaskAligner::new(patch_size),
            config,
            reporter: Box::new(NoOpProgressReporter),
            cancel: None,
        })
    }

    #[must_use]
    pub fn with_progress_reporter(mut self, reporter: Box<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Stop before the next batch once `flag` is set
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    #[must_use]
    pub fn config(&self) -> &DinoV2InferConfig {
        &self.config
    }

    /// Embed a dataset with the configured pooling mode and batch size
    ///
    /// # Errors
    /// - See [`DinoV2Inference::infer_on_segmentation_dataset`]
    pub fn infer(&self, dataset: Arc<dyn LabeledDataset>) -> Result<ResultSet> {
        self.infer_on_segmentation_dataset(
            dataset,
            self.config.average_non_masked_patches,
            self.config.batch_size,
        )
    }

    /// Embed every labeled instance of `dataset`
    ///
    /// With `average_non_masked_patches` each instance gets the occupancy
    /// weighted mean of its patch features, otherwise every instance of an
    /// image gets the image's class token. Records follow dataset order.
    ///
    /// # Errors
    /// - `InvalidConfig` for a zero batch size
    /// - `ShapeMismatch` when masks and images disagree or the backbone's
    ///   output does not fit the patch grid
    /// - `Cancelled` when the cancel flag was raised
    /// - Dataset loading and backbone failures
    #[instrument(
        skip(self, dataset),
        fields(backbone = %self.backbone.name(), size = %self.config.size, items = dataset.len())
    )]
    pub fn infer_on_segmentation_dataset(
        &self,
        dataset: Arc<dyn LabeledDataset>,
        average_non_masked_patches: bool,
        batch_size: usize,
    ) -> Result<ResultSet> {
        let mode = ExtractionMode::from_average_non_masked_patches(average_non_masked_patches);
        let loader = BatchLoader::new(Arc::clone(&dataset), batch_size, self.config.num_workers)?;
        let batches_total = loader.num_batches();
        let start = Instant::now();

        trace_info!(?mode, batch_size, batches_total, "Starting DINOv2 inference");
        self.reporter.start(batches_total);

        let mut results = ResultSet::new();
        for (index, batch) in loader.enumerate() {
            let outcome = self.check_cancelled(index).and_then(|()| {
                let batch = batch?;
                let _span = span!(Level::DEBUG, "batch", index, images = batch.len()).entered();
                self.embed_batch(&batch, mode, dataset.as_ref())
            });

            match outcome {
                Ok(records) => results.extend(records),
                Err(e) => {
                    self.reporter.report_error(&e.to_string());
                    return Err(e);
                },
            }
            self.reporter
                .report_batch(BatchProgress::new(index + 1, batches_total, results.len(), start));
        }

        self.reporter
            .finish(BatchProgress::new(batches_total, batches_total, results.len(), start));
        trace_info!(
            instances = results.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "DINOv2 inference complete"
        );
        Ok(results)
    }

    fn check_cancelled(&self, batches_done: usize) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(EmbedError::Cancelled(batches_done)),
            _ => Ok(()),
        }
    }

    /// Embed the instances of one collated batch
    ///
    /// # Errors
    /// - `ShapeMismatch` when masks and images disagree or the backbone's
    ///   output does not fit the patch grid
    /// - Backbone failures
    pub fn embed_batch(
        &self,
        batch: &Batch,
        mode: ExtractionMode,
        tiles: &dyn LabeledDataset,
    ) -> Result<Vec<ResultRecord>> {
        let (_, _, height, width) = batch.images.dim();
        let preprocessed = self.preprocessor.preprocess(batch.images.view())?;
        trace_debug!(
            padding = ?preprocessed.padding,
            grid = ?preprocessed.grid,
            "Preprocessed batch"
        );

        let features = {
            let _span = span!(Level::DEBUG, "backbone", backbone = %self.backbone.name()).entered();
            FeatureExtractor::new(self.backbone).extract(
                &preprocessed.images,
                preprocessed.grid,
                mode,
            )?
        };
        if features.batch_len() != batch.len() {
            return Err(EmbedError::shape_mismatch(
                "feature batch",
                batch.len(),
                features.batch_len(),
            ));
        }

        let mut records = Vec::new();
        for (image_index, labels) in batch.labels.iter().enumerate() {
            let (count, mask_h, mask_w) = labels.masks.dim();
            if count == 0 {
                continue;
            }
            labels.check_columns()?;
            if (mask_h, mask_w) != (height, width) {
                return Err(EmbedError::shape_mismatch(
                    &format!("masks of image {}", labels.image_id),
                    (height, width),
                    (mask_h, mask_w),
                ));
            }

            let occupancy = self.aligner.align(labels.masks.view(), preprocessed.padding)?;
            let embeddings = match &features {
                Features::PatchGrid(grid) => {
                    masked_average_batch(grid.index_axis(Axis(0), image_index), occupancy.view())?
                },
                Features::WholeImage(cls) => {
                    let row = cls.row(image_index);
                    Array2::from_shape_fn((count, row.len()), |(_, d)| row[d])
                },
            };

            let tile_path = tiles
                .tile_path(labels.image_id)
                .map(|p| p.display().to_string())
                .unwrap_or_default();

            for (instance, (embedding, mask)) in embeddings
                .outer_iter()
                .zip(occupancy.outer_iter())
                .enumerate()
            {
                records.push(ResultRecord {
                    labels: labels.labels[instance],
                    area: labels.area[instance],
                    iscrowd: labels.iscrowd[instance] != 0,
                    image_id: labels.image_id,
                    tiles_paths: tile_path.clone(),
                    embeddings: embedding.to_vec(),
                    down_sampled_masks: mask.outer_iter().map(|row| row.to_vec()).collect(),
                });
            }
        }

        log::debug!(
            "Embedded {} instances from {} images",
            records.len(),
            batch.len()
        );
        Ok(records)
    }
}
