//! Alignment of instance masks with the backbone's patch grid

use crate::{
    error::{EmbedError, Result},
    preprocessing::{PaddingSpec, PatchGridDims},
};
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Zip};

/// Pads instance masks like their image and block-averages them to patch resolution
#[derive(Debug, Clone, Copy)]
pub struct MaskAligner {
    patch_stride: usize,
}

impl MaskAligner {
    #[must_use]
    pub fn new(patch_stride: usize) -> Self {
        Self {
            patch_stride: patch_stride.max(1),
        }
    }

    #[must_use]
    pub fn patch_stride(&self) -> usize {
        self.patch_stride
    }

    /// Align every mask of one image, `(N, H, W)` -> `(N, H' / stride, W' / stride)`
    ///
    /// # Errors
    /// - `ShapeMismatch` if the padded mask is not a multiple of the patch stride
    pub fn align(&self, masks: ArrayView3<'_, u8>, padding: PaddingSpec) -> Result<Array3<f32>> {
        let (count, height, width) = masks.dim();
        let grid = self.grid_for(height, width, padding)?;

        let mut aligned = Array3::<f32>::zeros((count, grid.num_h, grid.num_w));
        for (mask, mut out) in masks.outer_iter().zip(aligned.outer_iter_mut()) {
            out.assign(&self.downsample(&pad_mask(mask, padding), grid));
        }
        Ok(aligned)
    }

    /// Align a single mask
    ///
    /// # Errors
    /// - `ShapeMismatch` if the padded mask is not a multiple of the patch stride
    pub fn align_one(&self, mask: ArrayView2<'_, u8>, padding: PaddingSpec) -> Result<Array2<f32>> {
        let (height, width) = mask.dim();
        let grid = self.grid_for(height, width, padding)?;
        Ok(self.downsample(&pad_mask(mask, padding), grid))
    }

    fn grid_for(&self, height: usize, width: usize, padding: PaddingSpec) -> Result<PatchGridDims> {
        let (padded_h, padded_w) = padding.padded_dims(height, width);
        if padded_h % self.patch_stride != 0 || padded_w % self.patch_stride != 0 {
            return Err(EmbedError::ShapeMismatch(format!(
                "padded mask {}x{} is not a multiple of patch stride {}",
                padded_h, padded_w, self.patch_stride
            )));
        }
        Ok(PatchGridDims {
            num_h: padded_h / self.patch_stride,
            num_w: padded_w / self.patch_stride,
        })
    }

    /// Mean over non-overlapping `stride x stride` blocks
    fn downsample(&self, padded: &Array2<f32>, grid: PatchGridDims) -> Array2<f32> {
        let stride = self.patch_stride;
        let cell_area = (stride * stride) as f32;
        let mut out = Array2::<f32>::zeros((grid.num_h, grid.num_w));
        Zip::indexed(&mut out).for_each(|(row, col), cell| {
            let block = padded.slice(s![
                row * stride..(row + 1) * stride,
                col * stride..(col + 1) * stride
            ]);
            *cell = block.sum() / cell_area;
        });
        out
    }
}

/// Zero-pad a binary mask with the offsets used for its image
#[must_use]
pub fn pad_mask(mask: ArrayView2<'_, u8>, padding: PaddingSpec) -> Array2<f32> {
    let (height, width) = mask.dim();
    let (padded_h, padded_w) = padding.padded_dims(height, width);
    let mut padded = Array2::<f32>::zeros((padded_h, padded_w));
    padded
        .slice_mut(s![
            padding.top..padding.top + height,
            padding.left..padding.left + width
        ])
        .assign(&mask.mapv(|v| if v > 0 { 1.0 } else { 0.0 }));
    padded
}
