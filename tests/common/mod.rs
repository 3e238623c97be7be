//! Shared fixtures for integration tests

#![allow(dead_code)]

use image::{Rgb, RgbImage};
use ndarray::{Array2, Array3, Array4, Axis};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use xprize_embed::{BackboneOutput, FeatureBackbone, Result};

/// Deterministic backbone: patch token `n` holds `n + d / 100` in dimension `d`
pub struct GridBackbone {
    pub dim: usize,
    calls: AtomicUsize,
}

impl GridBackbone {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn patch_value(n: usize, d: usize) -> f32 {
        n as f32 + d as f32 / 100.0
    }
}

impl FeatureBackbone for GridBackbone {
    fn forward(&self, input: &Array4<f32>) -> Result<BackboneOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (batch, _, height, width) = input.dim();
        let tokens = (height / 14) * (width / 14);
        let mut cls_tokens = Array2::<f32>::zeros((batch, self.dim));
        for (image, mut cls) in input.axis_iter(Axis(0)).zip(cls_tokens.outer_iter_mut()) {
            cls.fill(image.mean().unwrap_or(0.0));
        }
        Ok(BackboneOutput {
            cls_tokens,
            patch_tokens: Array3::from_shape_fn((batch, tokens, self.dim), |(_, n, d)| {
                Self::patch_value(n, d)
            }),
        })
    }

    fn embedding_dim(&self) -> usize {
        self.dim
    }

    fn patch_size(&self) -> usize {
        14
    }

    fn name(&self) -> &str {
        "grid"
    }
}

/// Write a solid-color PNG tile
pub fn write_tile(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_pixel(width, height, Rgb([120, 160, 90]))
        .save(&path)
        .unwrap();
    path
}

/// COCO file with two 70x70 tiles
///
/// Tile 1 carries a polygon over patch (2, 2) and an unlabeled uncompressed
/// RLE instance covering the first image column. Tile 2 carries a compressed
/// RLE instance. Tile 3 has no annotations.
pub fn write_coco_fixture(dir: &Path) -> PathBuf {
    write_tile(dir, "tile_1.png", 70, 70);
    write_tile(dir, "tile_2.png", 70, 70);
    write_tile(dir, "tile_3.png", 70, 70);

    let coco = json!({
        "images": [
            {"id": 1, "file_name": "tile_1.png", "width": 70, "height": 70},
            {"id": 2, "file_name": "tile_2.png", "width": 70, "height": 70},
            {"id": 3, "file_name": "tile_3.png", "width": 70, "height": 70}
        ],
        "categories": [{"id": 1, "name": "tree"}],
        "annotations": [
            {
                "id": 10, "image_id": 1, "category_id": 1, "iscrowd": 0,
                "segmentation": [[28.0, 28.0, 42.0, 28.0, 42.0, 42.0, 28.0, 42.0]],
                "area": 196.4
            },
            {
                "id": 11, "image_id": 1, "iscrowd": 1,
                "segmentation": {"size": [70, 70], "counts": [0, 70, 4830]}
            },
            {
                "id": 12, "image_id": 2, "category_id": 1, "iscrowd": 0,
                "segmentation": {"size": [70, 70], "counts": "0R2"}
            }
        ]
    });
    let path = dir.join("coco.json");
    std::fs::write(&path, serde_json::to_string_pretty(&coco).unwrap()).unwrap();
    path
}
