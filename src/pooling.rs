//! Mask-weighted pooling of patch features

use crate::error::{EmbedError, Result};
use ndarray::{Array1, Array2, ArrayView2, ArrayView3, Axis};

/// Occupancy-weighted mean of patch features for one instance
///
/// The weighted sum over all patches is divided by the number of patches
/// with non-zero occupancy. An instance with no occupied patch yields the
/// zero vector.
///
/// # Errors
/// - `ShapeMismatch` if the occupancy map does not match the feature grid
pub fn masked_average(
    features: ArrayView3<'_, f32>,
    occupancy: ArrayView2<'_, f32>,
) -> Result<Array1<f32>> {
    let (num_h, num_w, dim) = features.dim();
    if occupancy.dim() != (num_h, num_w) {
        return Err(EmbedError::shape_mismatch(
            "occupancy map",
            (num_h, num_w),
            occupancy.dim(),
        ));
    }

    let mut pooled = Array1::<f32>::zeros(dim);
    let mut occupied = 0usize;
    for (feature_row, occupancy_row) in features.outer_iter().zip(occupancy.outer_iter()) {
        for (feature, &weight) in feature_row.outer_iter().zip(occupancy_row.iter()) {
            if weight > 0.0 {
                occupied += 1;
                pooled.scaled_add(weight, &feature);
            }
        }
    }

    let divisor = occupied.max(1) as f32;
    pooled.mapv_inplace(|v| v / divisor);
    Ok(pooled)
}

/// Pool every instance of one image, `(N, H, W)` occupancy -> `(N, D)` embeddings
///
/// # Errors
/// - `ShapeMismatch` if an occupancy map does not match the feature grid
pub fn masked_average_batch(
    features: ArrayView3<'_, f32>,
    occupancy: ArrayView3<'_, f32>,
) -> Result<Array2<f32>> {
    let dim = features.len_of(Axis(2));
    let mut pooled = Array2::<f32>::zeros((occupancy.len_of(Axis(0)), dim));
    for (mask, mut row) in occupancy.outer_iter().zip(pooled.outer_iter_mut()) {
        row.assign(&masked_average(features, mask)?);
    }
    Ok(pooled)
}
