//! Labeled segmentation datasets, collation and batch loading

use crate::error::{EmbedError, Result};
use ndarray::{s, Array3, Array4, Axis};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

/// Label value substituted for instances without a category
pub const MISSING_LABEL: i64 = -1;

/// Instance annotations of one image
#[derive(Debug, Clone, Default)]
pub struct InstanceLabels {
    /// Binary masks at image resolution, `(N, H, W)`
    pub masks: Array3<u8>,
    pub labels: Vec<Option<i64>>,
    pub area: Vec<f64>,
    pub iscrowd: Vec<u8>,
    pub image_id: u64,
    /// Source polygons (flat `x, y` lists) when the annotations carried them
    pub polygons: Option<Vec<Vec<Vec<f64>>>>,
}

impl InstanceLabels {
    #[must_use]
    pub fn len(&self) -> usize {
        self.masks.len_of(Axis(0))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One dataset item: a `(C, H, W)` image and its instances
#[derive(Debug, Clone)]
pub struct Sample {
    pub image: Array3<f32>,
    pub labels: InstanceLabels,
}

/// Random-access dataset of labeled tiles
pub trait LabeledDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load the item at `index`
    ///
    /// # Errors
    /// - Tile decoding or annotation errors
    fn get(&self, index: usize) -> Result<Sample>;

    /// Tile file the image with `image_id` was read from
    fn tile_path(&self, image_id: u64) -> Option<PathBuf>;
}

/// Labels of one image after collation
#[derive(Debug, Clone)]
pub struct CollatedLabels {
    pub masks: Array3<u8>,
    /// Category ids with [`MISSING_LABEL`] in place of absent ones
    pub labels: Vec<i64>,
    pub area: Vec<f32>,
    pub iscrowd: Vec<u8>,
    pub image_id: u64,
    pub polygons: Option<Vec<Vec<Vec<f64>>>>,
}

impl CollatedLabels {
    /// Check that every per-instance column has one entry per mask
    ///
    /// # Errors
    /// - `ShapeMismatch` naming the first column whose length differs
    pub fn check_columns(&self) -> Result<()> {
        let count = self.masks.len_of(Axis(0));
        let columns = [
            ("labels", self.labels.len()),
            ("area", self.area.len()),
            ("iscrowd", self.iscrowd.len()),
            (
                "polygons",
                self.polygons.as_ref().map_or(count, Vec::len),
            ),
        ];
        for (name, len) in columns {
            if len != count {
                return Err(EmbedError::shape_mismatch(
                    &format!("{} per mask of image {}", name, self.image_id),
                    count,
                    len,
                ));
            }
        }
        Ok(())
    }
}

/// Stacked images plus per-image labels
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(B, C, H, W)`
    pub images: Array4<f32>,
    pub labels: Vec<CollatedLabels>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Stack samples into a batch and normalize their label columns
///
/// Absent labels become [`MISSING_LABEL`] and areas are truncated to whole
/// pixels.
///
/// # Errors
/// - `ShapeMismatch` if images differ in shape or a label column disagrees
///   with the mask count
/// - `Dataset` for an empty sample list
pub fn collate_segmentation(samples: Vec<Sample>) -> Result<Batch> {
    let first = samples
        .first()
        .ok_or_else(|| EmbedError::dataset("cannot collate an empty batch"))?;
    let (channels, height, width) = first.image.dim();

    let mut images = Array4::<f32>::zeros((samples.len(), channels, height, width));
    let mut labels = Vec::with_capacity(samples.len());
    for (index, sample) in samples.into_iter().enumerate() {
        if sample.image.dim() != (channels, height, width) {
            return Err(EmbedError::shape_mismatch(
                "batched image",
                (channels, height, width),
                sample.image.dim(),
            ));
        }
        let instances = sample.labels;
        let collated = CollatedLabels {
            labels: instances
                .labels
                .iter()
                .map(|label| label.unwrap_or(MISSING_LABEL))
                .collect(),
            // Areas are truncated to whole pixels
            area: instances.area.iter().map(|&a| a.trunc() as f32).collect(),
            iscrowd: instances.iscrowd,
            image_id: instances.image_id,
            polygons: instances.polygons,
            masks: instances.masks,
        };
        collated.check_columns()?;

        images.slice_mut(s![index, .., .., ..]).assign(&sample.image);
        labels.push(collated);
    }

    Ok(Batch { images, labels })
}

fn load_batch(dataset: &dyn LabeledDataset, start: usize, end: usize) -> Result<Batch> {
    let samples = (start..end)
        .map(|index| dataset.get(index))
        .collect::<Result<Vec<_>>>()?;
    collate_segmentation(samples)
}

/// Worker pool where worker `w` loads batches `w, w + n, w + 2n, ...`
///
/// Each worker owns a bounded channel, so reading the receivers round-robin
/// yields batches in dataset order without a reorder buffer.
struct PrefetchBatches {
    receivers: Vec<Receiver<Result<Batch>>>,
    handles: Vec<thread::JoinHandle<()>>,
    next_batch: usize,
    num_batches: usize,
}

impl PrefetchBatches {
    fn spawn(dataset: Arc<dyn LabeledDataset>, batch_size: usize, num_workers: usize) -> Self {
        let len = dataset.len();
        let num_batches = len.div_ceil(batch_size);
        let workers = num_workers.clamp(1, num_batches.max(1));

        let mut receivers = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = mpsc::sync_channel(1);
            let dataset = Arc::clone(&dataset);
            handles.push(thread::spawn(move || {
                for batch in (worker..num_batches).step_by(workers) {
                    let start = batch * batch_size;
                    let end = (start + batch_size).min(len);
                    if tx.send(load_batch(dataset.as_ref(), start, end)).is_err() {
                        return;
                    }
                }
            }));
            receivers.push(rx);
        }

        Self {
            receivers,
            handles,
            next_batch: 0,
            num_batches,
        }
    }

    fn next(&mut self) -> Option<Result<Batch>> {
        if self.next_batch >= self.num_batches {
            return None;
        }
        let rx = &self.receivers[self.next_batch % self.receivers.len()];
        self.next_batch += 1;
        rx.recv().ok()
    }
}

impl Drop for PrefetchBatches {
    fn drop(&mut self) {
        // Closing the channels unblocks workers waiting on a full queue
        self.receivers.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

enum LoaderBackend {
    Immediate {
        dataset: Arc<dyn LabeledDataset>,
        position: usize,
    },
    Prefetch(PrefetchBatches),
}

/// Ordered iterator over fixed-size batches of a dataset
///
/// The last batch may be smaller. With `num_workers > 0` that many threads
/// decode batches ahead of the consumer, one batch queued per worker.
pub struct BatchLoader {
    backend: LoaderBackend,
    batch_size: usize,
    total: usize,
}

impl BatchLoader {
    /// # Errors
    /// - `InvalidConfig` if `batch_size` is zero
    pub fn new(
        dataset: Arc<dyn LabeledDataset>,
        batch_size: usize,
        num_workers: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(EmbedError::config_value_error(
                "batch_size",
                0,
                ">= 1",
                Some(1),
            ));
        }
        let total = dataset.len();
        let backend = if num_workers > 0 {
            LoaderBackend::Prefetch(PrefetchBatches::spawn(dataset, batch_size, num_workers))
        } else {
            LoaderBackend::Immediate {
                dataset,
                position: 0,
            }
        };
        Ok(Self {
            backend,
            batch_size,
            total,
        })
    }

    /// Number of batches the loader yields
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.total.div_ceil(self.batch_size)
    }
}

impl Iterator for BatchLoader {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.backend {
            LoaderBackend::Immediate { dataset, position } => {
                let len = dataset.len();
                if *position >= len {
                    return None;
                }
                let start = *position;
                let end = (start + self.batch_size).min(len);
                *position = end;
                Some(load_batch(dataset.as_ref(), start, end))
            },
            LoaderBackend::Prefetch(prefetch) => prefetch.next(),
        }
    }
}

/// Dataset held entirely in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<Sample>,
    /// Tile path by image id; the first sample pushed for an id wins
    tile_paths: HashMap<u64, PathBuf>,
}

impl InMemoryDataset {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: Sample, tile_path: PathBuf) {
        self.tile_paths
            .entry(sample.labels.image_id)
            .or_insert(tile_path);
        self.samples.push(sample);
    }
}

impl LabeledDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        self.samples.get(index).cloned().ok_or_else(|| {
            EmbedError::dataset(format!(
                "index {} out of range for {} samples",
                index,
                self.samples.len()
            ))
        })
    }

    fn tile_path(&self, image_id: u64) -> Option<PathBuf> {
        self.tile_paths.get(&image_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(image_id: u64, labels: Vec<Option<i64>>) -> Sample {
        let count = labels.len();
        Sample {
            image: Array3::from_elem((3, 14, 14), image_id as f32),
            labels: InstanceLabels {
                masks: Array3::ones((count, 14, 14)),
                area: vec![196.7; count],
                iscrowd: vec![0; count],
                labels,
                image_id,
                polygons: None,
            },
        }
    }

    fn dataset(count: u64) -> Arc<dyn LabeledDataset> {
        let mut dataset = InMemoryDataset::new();
        for id in 0..count {
            dataset.push(sample(id, vec![Some(id as i64)]), format!("tile_{id}.tif").into());
        }
        Arc::new(dataset)
    }

    #[test]
    fn test_collate_substitutes_missing_labels() {
        let batch = collate_segmentation(vec![
            sample(1, vec![Some(3), None]),
            sample(2, vec![None]),
        ])
        .unwrap();
        assert_eq!(batch.images.dim(), (2, 3, 14, 14));
        assert_eq!(batch.labels[0].labels, vec![3, MISSING_LABEL]);
        assert_eq!(batch.labels[1].labels, vec![MISSING_LABEL]);
        assert_eq!(batch.labels[0].area, vec![196.0f32, 196.0]);
        assert_eq!(batch.images[[1, 0, 0, 0]], 2.0);
    }

    #[test]
    fn test_collate_keeps_polygons() {
        let mut with_polygons = sample(1, vec![Some(1)]);
        let square = vec![vec![0.0, 0.0, 14.0, 0.0, 14.0, 14.0, 0.0, 14.0]];
        with_polygons.labels.polygons = Some(vec![square.clone()]);

        let batch = collate_segmentation(vec![with_polygons, sample(2, vec![None])]).unwrap();
        assert_eq!(batch.labels[0].polygons, Some(vec![square]));
        assert_eq!(batch.labels[1].polygons, None);
    }

    #[test]
    fn test_collate_rejects_short_label_columns() {
        let mut short_area = sample(1, vec![Some(1), Some(2)]);
        short_area.labels.area.pop();
        assert!(matches!(
            collate_segmentation(vec![short_area]),
            Err(EmbedError::ShapeMismatch(msg)) if msg.contains("area")
        ));

        let mut long_iscrowd = sample(1, vec![Some(1)]);
        long_iscrowd.labels.iscrowd.push(1);
        assert!(matches!(
            collate_segmentation(vec![long_iscrowd]),
            Err(EmbedError::ShapeMismatch(msg)) if msg.contains("iscrowd")
        ));

        let mut no_labels = sample(1, vec![Some(1)]);
        no_labels.labels.labels.clear();
        assert!(matches!(
            collate_segmentation(vec![no_labels]),
            Err(EmbedError::ShapeMismatch(msg)) if msg.contains("labels")
        ));
    }

    #[test]
    fn test_collate_rejects_mixed_shapes() {
        let mut odd = sample(2, vec![Some(1)]);
        odd.image = Array3::zeros((3, 28, 14));
        let result = collate_segmentation(vec![sample(1, vec![Some(1)]), odd]);
        assert!(matches!(result, Err(EmbedError::ShapeMismatch(_))));
        assert!(matches!(
            collate_segmentation(Vec::new()),
            Err(EmbedError::Dataset(_))
        ));
    }

    #[test]
    fn test_loader_preserves_order_with_short_tail() {
        for workers in [0, 1, 2, 3, 8] {
            let loader = BatchLoader::new(dataset(5), 2, workers).unwrap();
            assert_eq!(loader.num_batches(), 3);
            let ids: Vec<Vec<u64>> = loader
                .map(|batch| batch.unwrap().labels.iter().map(|l| l.image_id).collect())
                .collect();
            assert_eq!(ids, vec![vec![0, 1], vec![2, 3], vec![4]]);
        }
    }

    #[test]
    fn test_dropping_prefetch_loader_early_does_not_hang() {
        let mut loader = BatchLoader::new(dataset(50), 1, 1).unwrap();
        assert!(loader.next().is_some());
        drop(loader);
    }

    #[test]
    fn test_worker_pool_decodes_in_parallel() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        struct SlowDataset {
            inner: Arc<dyn LabeledDataset>,
            active: AtomicUsize,
            peak: AtomicUsize,
        }

        impl LabeledDataset for SlowDataset {
            fn len(&self) -> usize {
                self.inner.len()
            }

            fn get(&self, index: usize) -> Result<Sample> {
                let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(active, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                self.active.fetch_sub(1, Ordering::SeqCst);
                self.inner.get(index)
            }

            fn tile_path(&self, image_id: u64) -> Option<PathBuf> {
                self.inner.tile_path(image_id)
            }
        }

        let slow = Arc::new(SlowDataset {
            inner: dataset(8),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let loader = BatchLoader::new(Arc::clone(&slow) as Arc<dyn LabeledDataset>, 1, 4).unwrap();
        let ids: Vec<u64> = loader
            .map(|batch| batch.unwrap().labels[0].image_id)
            .collect();

        assert_eq!(ids, (0..8).collect::<Vec<_>>());
        assert!(slow.peak.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn test_loader_error_is_yielded_in_place() {
        let mut data = InMemoryDataset::new();
        data.push(sample(0, vec![Some(0)]), "a.tif".into());
        let mut odd = sample(1, vec![Some(1)]);
        odd.image = Array3::zeros((3, 28, 14));
        data.push(odd, "b.tif".into());
        data.push(sample(2, vec![Some(2)]), "c.tif".into());

        let results: Vec<_> = BatchLoader::new(Arc::new(data), 2, 2).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(EmbedError::ShapeMismatch(_))));
        assert_eq!(results[1].as_ref().unwrap().labels[0].image_id, 2);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(matches!(
            BatchLoader::new(dataset(1), 0, 0),
            Err(EmbedError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_tile_path_lookup() {
        let data = dataset(3);
        assert_eq!(data.tile_path(2), Some(PathBuf::from("tile_2.tif")));
        assert_eq!(data.tile_path(9), None);
    }
}
