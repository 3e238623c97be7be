//! COCO instance-segmentation annotations over a folder of tiles
//!
//! Each COCO image is one tile under the tiles root. Segmentations are
//! rasterised at the image size declared in the annotation file; polygons,
//! uncompressed RLE and compressed RLE strings are all accepted.

use crate::dataset::{InstanceLabels, LabeledDataset, Sample};
use crate::error::{EmbedError, Result};
use ndarray::{Array2, Array3, Axis};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct CocoFile {
    pub images: Vec<CocoImage>,
    #[serde(default)]
    pub annotations: Vec<CocoAnnotation>,
    #[serde(default)]
    pub categories: Vec<CocoCategory>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CocoImage {
    pub id: u64,
    pub file_name: String,
    pub width: usize,
    pub height: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CocoCategory {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CocoAnnotation {
    #[serde(default)]
    pub id: Option<u64>,
    pub image_id: u64,
    #[serde(default)]
    pub category_id: Option<i64>,
    pub segmentation: Segmentation,
    #[serde(default)]
    pub area: Option<f64>,
    #[serde(default)]
    pub iscrowd: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Segmentation {
    /// Flat `[x0, y0, x1, y1, ...]` rings
    Polygons(Vec<Vec<f64>>),
    Rle(Rle),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rle {
    /// `[height, width]`
    pub size: [usize; 2],
    pub counts: RleCounts,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RleCounts {
    Uncompressed(Vec<u64>),
    Compressed(String),
}

impl Segmentation {
    /// Rasterise to a `height x width` binary mask
    ///
    /// # Errors
    /// - `Dataset` for malformed RLE
    pub fn to_mask(&self, height: usize, width: usize) -> Result<Array2<u8>> {
        match self {
            Self::Polygons(rings) => Ok(rasterize_polygons(rings, height, width)),
            Self::Rle(rle) => {
                if rle.size != [height, width] {
                    return Err(EmbedError::shape_mismatch(
                        "RLE size",
                        [height, width],
                        rle.size,
                    ));
                }
                let counts = match &rle.counts {
                    RleCounts::Uncompressed(counts) => counts.clone(),
                    RleCounts::Compressed(encoded) => decode_rle_string(encoded)?,
                };
                decode_rle_counts(&counts, height, width)
            },
        }
    }

    fn polygons(&self) -> Option<&Vec<Vec<f64>>> {
        match self {
            Self::Polygons(rings) => Some(rings),
            Self::Rle(_) => None,
        }
    }
}

/// Even-odd fill of polygon rings, sampling each pixel at its centre
#[must_use]
pub fn rasterize_polygons(rings: &[Vec<f64>], height: usize, width: usize) -> Array2<u8> {
    let mut mask = Array2::<u8>::zeros((height, width));
    let mut crossings = Vec::new();

    for ring in rings {
        let points: Vec<(f64, f64)> = ring.chunks_exact(2).map(|p| (p[0], p[1])).collect();
        if points.len() < 3 {
            continue;
        }

        for (row, mut mask_row) in mask.axis_iter_mut(Axis(0)).enumerate() {
            let yc = row as f64 + 0.5;
            crossings.clear();
            for (i, &(x0, y0)) in points.iter().enumerate() {
                let (x1, y1) = points[(i + 1) % points.len()];
                if (y0 <= yc && yc < y1) || (y1 <= yc && yc < y0) {
                    crossings.push(x0 + (yc - y0) * (x1 - x0) / (y1 - y0));
                }
            }
            crossings.sort_by(f64::total_cmp);

            for span in crossings.chunks_exact(2) {
                let start = (span[0] - 0.5).ceil().max(0.0) as usize;
                let end = ((span[1] - 0.5).ceil().max(0.0) as usize).min(width);
                for col in start..end {
                    mask_row[col] = 1;
                }
            }
        }
    }
    mask
}

/// Expand column-major run lengths (zeros first) into a mask
///
/// # Errors
/// - `Dataset` if the runs do not cover exactly `height * width` pixels
pub fn decode_rle_counts(counts: &[u64], height: usize, width: usize) -> Result<Array2<u8>> {
    let total = counts
        .iter()
        .try_fold(0u64, |acc, &count| acc.checked_add(count))
        .ok_or_else(|| EmbedError::dataset("RLE run lengths overflow"))?;
    if total != (height * width) as u64 {
        return Err(EmbedError::dataset(format!(
            "RLE covers {} pixels, expected {}x{}",
            total, height, width
        )));
    }

    let mut mask = Array2::<u8>::zeros((height, width));
    let mut index = 0usize;
    for (run, &count) in counts.iter().enumerate() {
        let count = count as usize;
        if run % 2 == 1 {
            for pixel in index..index + count {
                mask[[pixel % height, pixel / height]] = 1;
            }
        }
        index += count;
    }
    Ok(mask)
}

/// Decode the compact COCO RLE string into run lengths
///
/// Each run is stored in 5-bit groups offset by 48, with a continuation bit
/// and sign extension. From the fourth run on, values are deltas against the
/// run two positions back.
///
/// # Errors
/// - `Dataset` for characters outside the encoding, negative runs or runs
///   that do not fit in 64 bits
pub fn decode_rle_string(encoded: &str) -> Result<Vec<u64>> {
    let bytes = encoded.as_bytes();
    let mut counts: Vec<i64> = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let mut value: i64 = 0;
        let mut shift: u32 = 0;
        loop {
            if 5 * shift >= i64::BITS {
                return Err(EmbedError::dataset("RLE run too long"));
            }
            let byte = *bytes
                .get(pos)
                .ok_or_else(|| EmbedError::dataset("truncated RLE string"))?;
            let chunk = i64::from(byte)
                .checked_sub(48)
                .filter(|c| (0..64).contains(c))
                .ok_or_else(|| {
                    EmbedError::dataset(format!("invalid RLE character '{}'", byte as char))
                })?;
            value |= (chunk & 0x1f) << (5 * shift);
            pos += 1;
            shift += 1;
            if chunk & 0x20 == 0 {
                if chunk & 0x10 != 0 {
                    value |= (-1i64).checked_shl(5 * shift).unwrap_or(0);
                }
                break;
            }
        }
        if counts.len() > 2 {
            value = value
                .checked_add(counts[counts.len() - 2])
                .ok_or_else(|| EmbedError::dataset("RLE run too long"))?;
        }
        counts.push(value);
    }

    counts
        .into_iter()
        .map(|c| {
            u64::try_from(c).map_err(|_| EmbedError::dataset(format!("negative RLE run {}", c)))
        })
        .collect()
}

/// Labeled tiles described by a COCO file
#[derive(Debug, Clone)]
pub struct CocoSegmentationDataset {
    tiles_root: PathBuf,
    images: Vec<CocoImage>,
    /// Position in `images` by image id
    image_index: HashMap<u64, usize>,
    annotations: HashMap<u64, Vec<CocoAnnotation>>,
    categories: HashMap<i64, String>,
}

impl CocoSegmentationDataset {
    /// Read `coco_path` and index its annotations by image
    ///
    /// Images without any annotation are skipped.
    ///
    /// # Errors
    /// - File read or JSON errors
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(coco_path: P, tiles_root: Q) -> Result<Self> {
        let coco_path = coco_path.as_ref();
        let content = fs::read_to_string(coco_path)
            .map_err(|e| EmbedError::file_io_error("read COCO file", coco_path, &e))?;
        let coco: CocoFile = serde_json::from_str(&content)?;
        Ok(Self::from_coco(coco, tiles_root.as_ref()))
    }

    #[must_use]
    pub fn from_coco(coco: CocoFile, tiles_root: &Path) -> Self {
        let mut annotations: HashMap<u64, Vec<CocoAnnotation>> = HashMap::new();
        for annotation in coco.annotations {
            annotations
                .entry(annotation.image_id)
                .or_default()
                .push(annotation);
        }

        let total = coco.images.len();
        let images: Vec<CocoImage> = coco
            .images
            .into_iter()
            .filter(|image| annotations.contains_key(&image.id))
            .collect();
        if images.len() < total {
            log::debug!(
                "Skipping {} tiles without annotations",
                total - images.len()
            );
        }
        log::info!(
            "Loaded COCO dataset with {} labeled tiles from {}",
            images.len(),
            tiles_root.display()
        );

        let image_index = images
            .iter()
            .enumerate()
            .map(|(position, image)| (image.id, position))
            .collect();

        Self {
            tiles_root: tiles_root.to_path_buf(),
            images,
            image_index,
            annotations,
            categories: coco
                .categories
                .into_iter()
                .map(|category| (category.id, category.name))
                .collect(),
        }
    }

    /// Category name for a category id
    #[must_use]
    pub fn category_name(&self, id: i64) -> Option<&str> {
        self.categories.get(&id).map(String::as_str)
    }

    fn load_tile(&self, image: &CocoImage) -> Result<Array3<f32>> {
        let path = self.tiles_root.join(&image.file_name);
        let rgb = image::open(&path)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        if (height as usize, width as usize) != (image.height, image.width) {
            return Err(EmbedError::shape_mismatch(
                &format!("tile {}", path.display()),
                (image.height, image.width),
                (height, width),
            ));
        }

        let (height, width) = (image.height, image.width);
        let mut tile = Array3::<f32>::zeros((3, height, width));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for (channel, &value) in pixel.0.iter().enumerate() {
                tile[[channel, y as usize, x as usize]] = f32::from(value) / 255.0;
            }
        }
        Ok(tile)
    }

    fn load_labels(&self, image: &CocoImage) -> Result<InstanceLabels> {
        let annotations = self
            .annotations
            .get(&image.id)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut masks = Array3::<u8>::zeros((annotations.len(), image.height, image.width));
        let mut labels = InstanceLabels {
            image_id: image.id,
            ..InstanceLabels::default()
        };
        let mut polygons = Vec::new();

        for (annotation, mut mask) in annotations.iter().zip(masks.outer_iter_mut()) {
            let raster = annotation
                .segmentation
                .to_mask(image.height, image.width)
                .map_err(|e| {
                    EmbedError::dataset(format!(
                        "annotation {:?} of image {}: {}",
                        annotation.id, image.id, e
                    ))
                })?;
            let pixel_area = raster.iter().filter(|&&v| v > 0).count() as f64;
            mask.assign(&raster);

            labels.labels.push(annotation.category_id);
            labels.area.push(annotation.area.unwrap_or(pixel_area));
            labels.iscrowd.push(annotation.iscrowd);
            if let Some(rings) = annotation.segmentation.polygons() {
                polygons.push(rings.clone());
            }
        }

        if polygons.len() == annotations.len() {
            labels.polygons = Some(polygons);
        }
        labels.masks = masks;
        Ok(labels)
    }
}

impl LabeledDataset for CocoSegmentationDataset {
    fn len(&self) -> usize {
        self.images.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let image = self.images.get(index).ok_or_else(|| {
            EmbedError::dataset(format!(
                "index {} out of range for {} tiles",
                index,
                self.images.len()
            ))
        })?;
        Ok(Sample {
            image: self.load_tile(image)?,
            labels: self.load_labels(image)?,
        })
    }

    fn tile_path(&self, image_id: u64) -> Option<PathBuf> {
        self.image_index
            .get(&image_id)
            .map(|&position| self.tiles_root.join(&self.images[position].file_name))
    }
}
