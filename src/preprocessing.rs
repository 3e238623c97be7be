//! Patch-grid preprocessing for vision-transformer backbones
//!
//! Images are normalized (per instance or with a fixed profile) and then
//! zero-padded so both spatial dimensions are exact multiples of the patch
//! stride. The padding amounts are returned so that segmentation masks can be
//! padded identically before they are reduced to the patch grid.

use crate::{
    config::NormalizationProfile,
    error::{EmbedError, Result},
};
use ndarray::{s, Array3, Array4, ArrayView4, Axis};

/// Lower bound on the per-channel standard deviation used by instance normalization
const MIN_INSTANCE_STD: f32 = 1e-6;

/// Pixel padding applied around the spatial dimensions of an image batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaddingSpec {
    pub left: usize,
    pub right: usize,
    pub top: usize,
    pub bottom: usize,
}

impl PaddingSpec {
    /// Padding that brings `height x width` up to multiples of `stride`
    ///
    /// The leading side gets the floor of half the total pad, the trailing
    /// side gets the remainder.
    #[must_use]
    pub fn for_dims(height: usize, width: usize, stride: usize) -> Self {
        let (top, bottom) = split_pad(height, stride);
        let (left, right) = split_pad(width, stride);
        Self {
            left,
            right,
            top,
            bottom,
        }
    }

    #[must_use]
    pub fn padded_dims(&self, height: usize, width: usize) -> (usize, usize) {
        (
            height + self.top + self.bottom,
            width + self.left + self.right,
        )
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

fn split_pad(size: usize, stride: usize) -> (usize, usize) {
    let padded = size.div_ceil(stride) * stride;
    let pad = padded - size;
    let leading = pad / 2;
    (leading, pad - leading)
}

/// Number of patches along each spatial dimension of a padded batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchGridDims {
    pub num_h: usize,
    pub num_w: usize,
}

impl PatchGridDims {
    #[must_use]
    pub fn num_patches(&self) -> usize {
        self.num_h * self.num_w
    }
}

/// Output of [`PatchGridPreprocessor::preprocess`]
#[derive(Debug, Clone)]
pub struct PreprocessedBatch {
    /// Normalized and padded images, `(B, C, H', W')`
    pub images: Array4<f32>,
    pub padding: PaddingSpec,
    pub grid: PatchGridDims,
}

/// How pixel statistics are standardized before padding
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalization {
    Disabled,
    /// Each image uses its own per-channel mean and (biased) standard deviation
    PerInstance,
    Profile { mean: [f32; 3], std: [f32; 3] },
}

/// Pads image batches to the patch grid of a vision transformer
#[derive(Debug, Clone)]
pub struct PatchGridPreprocessor {
    patch_stride: usize,
    normalization: Normalization,
}

impl PatchGridPreprocessor {
    /// Create a preprocessor
    ///
    /// `profile` is only consulted when `normalize` is set and instance
    /// normalization is off.
    ///
    /// # Errors
    /// - `InvalidConfig` for a zero patch stride
    /// - `InvalidProfile` for an unrecognized profile name while profile normalization is active
    pub fn new(
        patch_stride: usize,
        normalize: bool,
        instance_normalization: bool,
        profile: &str,
    ) -> Result<Self> {
        if patch_stride == 0 {
            return Err(EmbedError::config_value_error(
                "patch stride",
                patch_stride,
                ">= 1",
                None,
            ));
        }

        let normalization = match (normalize, instance_normalization) {
            (false, _) => Normalization::Disabled,
            (true, true) => Normalization::PerInstance,
            (true, false) => match profile.parse::<NormalizationProfile>()?.mean_std() {
                Some((mean, std)) => Normalization::Profile { mean, std },
                None => Normalization::Disabled,
            },
        };

        Ok(Self {
            patch_stride,
            normalization,
        })
    }

    #[must_use]
    pub fn with_normalization(patch_stride: usize, normalization: Normalization) -> Self {
        Self {
            patch_stride: patch_stride.max(1),
            normalization,
        }
    }

    #[must_use]
    pub fn patch_stride(&self) -> usize {
        self.patch_stride
    }

    #[must_use]
    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// Normalize and pad an image batch of shape `(B, C, H, W)`
    ///
    /// # Errors
    /// - `ShapeMismatch` when profile normalization is requested on a batch
    ///   whose channel count differs from the profile's
    pub fn preprocess(&self, images: ArrayView4<'_, f32>) -> Result<PreprocessedBatch> {
        let (batch, channels, height, width) = images.dim();
        let mut normalized = images.to_owned();

        match self.normalization {
            Normalization::Disabled => {},
            Normalization::PerInstance => {
                for mut image in normalized.outer_iter_mut() {
                    for mut channel in image.outer_iter_mut() {
                        let mean = channel.mean().unwrap_or(0.0);
                        let var = channel.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(0.0);
                        let std = var.sqrt().max(MIN_INSTANCE_STD);
                        channel.mapv_inplace(|v| (v - mean) / std);
                    }
                }
            },
            Normalization::Profile { mean, std } => {
                if channels != mean.len() {
                    return Err(EmbedError::shape_mismatch(
                        "image channels for profile normalization",
                        mean.len(),
                        channels,
                    ));
                }
                for (c, (m, s)) in mean.iter().zip(std.iter()).enumerate() {
                    normalized
                        .index_axis_mut(Axis(1), c)
                        .mapv_inplace(|v| (v - m) / s);
                }
            },
        }

        let padding = PaddingSpec::for_dims(height, width, self.patch_stride);
        let (padded_h, padded_w) = padding.padded_dims(height, width);

        let images = if padding.is_zero() {
            normalized
        } else {
            let mut padded = Array4::<f32>::zeros((batch, channels, padded_h, padded_w));
            padded
                .slice_mut(s![
                    ..,
                    ..,
                    padding.top..padding.top + height,
                    padding.left..padding.left + width
                ])
                .assign(&normalized);
            padded
        };

        let grid = PatchGridDims {
            num_h: padded_h / self.patch_stride,
            num_w: padded_w / self.patch_stride,
        };

        log::trace!(
            "Preprocessed batch {:?} -> {:?}, padding {:?}, grid {}x{}",
            (batch, channels, height, width),
            images.dim(),
            padding,
            grid.num_h,
            grid.num_w
        );

        Ok(PreprocessedBatch {
            images,
            padding,
            grid,
        })
    }
}

/// Reshape flat per-patch tokens `(B, N, D)` into a grid `(B, H, W, D)`
///
/// # Errors
/// - `ShapeMismatch` if `N != grid.num_h * grid.num_w`
pub fn patch_tokens_to_grid(
    tokens: Array3<f32>,
    grid: PatchGridDims,
) -> Result<Array4<f32>> {
    let (batch, num_patches, dim) = tokens.dim();
    if num_patches != grid.num_patches() {
        return Err(EmbedError::shape_mismatch(
            "patch token count",
            grid.num_patches(),
            num_patches,
        ));
    }

    // Row-major patch order means a contiguous reshape is exact.
    let tokens = tokens.as_standard_layout().into_owned();
    tokens
        .into_shape_with_order((batch, grid.num_h, grid.num_w, dim))
        .map_err(|e| EmbedError::ShapeMismatch(e.to_string()))
}

/// Flatten a patch grid `(B, H, W, D)` back into tokens `(B, H * W, D)`
///
/// # Errors
/// - `ShapeMismatch` if the grid cannot be reshaped
pub fn grid_to_patch_tokens(grid: Array4<f32>) -> Result<Array3<f32>> {
    let (batch, num_h, num_w, dim) = grid.dim();
    let grid = grid.as_standard_layout().into_owned();
    grid.into_shape_with_order((batch, num_h * num_w, dim))
        .map_err(|e| EmbedError::ShapeMismatch(e.to_string()))
}
