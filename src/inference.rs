//! Backbone abstraction and feature extraction

use crate::{
    error::{EmbedError, Result},
    preprocessing::{patch_tokens_to_grid, PatchGridDims},
};
use ndarray::{Array2, Array3, Array4};

/// Raw token output of a DINOv2-style backbone
#[derive(Debug, Clone)]
pub struct BackboneOutput {
    /// Normalized class token per image, `(B, D)`
    pub cls_tokens: Array2<f32>,
    /// Normalized patch tokens per image in row-major patch order, `(B, N, D)`
    pub patch_tokens: Array3<f32>,
}

/// Trait for frozen vision-transformer backbones
///
/// Implementations are loaded once and used read-only; `forward` never
/// updates weights.
pub trait FeatureBackbone {
    /// Run the backbone on a padded `(B, C, H, W)` batch
    ///
    /// # Errors
    /// - Model inference failures
    /// - Tensor conversion errors
    fn forward(&self, input: &Array4<f32>) -> Result<BackboneOutput>;

    /// Dimension of every output token
    fn embedding_dim(&self) -> usize;

    /// Patch side length in pixels
    fn patch_size(&self) -> usize;

    /// Human-readable backbone name for logs
    fn name(&self) -> &str;
}

/// What the extractor returns for each image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMode {
    /// One summary vector per image
    WholeImage,
    /// One vector per patch, arranged on the patch grid
    PerPatch,
}

impl ExtractionMode {
    #[must_use]
    pub fn from_average_non_masked_patches(average: bool) -> Self {
        if average {
            Self::PerPatch
        } else {
            Self::WholeImage
        }
    }
}

/// Features produced for one batch
#[derive(Debug, Clone)]
pub enum Features {
    /// `(B, D)`
    WholeImage(Array2<f32>),
    /// `(B, H, W, D)`
    PatchGrid(Array4<f32>),
}

impl Features {
    #[must_use]
    pub fn batch_len(&self) -> usize {
        match self {
            Self::WholeImage(f) => f.nrows(),
            Self::PatchGrid(f) => f.len_of(ndarray::Axis(0)),
        }
    }
}

/// Runs a backbone and shapes its output for pooling
pub struct FeatureExtractor<'a> {
    backbone: &'a dyn FeatureBackbone,
}

impl<'a> FeatureExtractor<'a> {
    #[must_use]
    pub fn new(backbone: &'a dyn FeatureBackbone) -> Self {
        Self { backbone }
    }

    /// Extract features from a preprocessed batch
    ///
    /// # Errors
    /// - Backbone inference failures
    /// - `ShapeMismatch` when the backbone's patch count or token dimension
    ///   disagrees with the patch grid
    pub fn extract(
        &self,
        padded: &Array4<f32>,
        grid: PatchGridDims,
        mode: ExtractionMode,
    ) -> Result<Features> {
        let batch = padded.len_of(ndarray::Axis(0));
        let output = self.backbone.forward(padded)?;

        let dim = self.backbone.embedding_dim();
        if output.cls_tokens.dim() != (batch, dim) {
            return Err(EmbedError::shape_mismatch(
                "class tokens",
                (batch, dim),
                output.cls_tokens.dim(),
            ));
        }

        match mode {
            ExtractionMode::WholeImage => Ok(Features::WholeImage(output.cls_tokens)),
            ExtractionMode::PerPatch => {
                let (out_batch, _, out_dim) = output.patch_tokens.dim();
                if out_batch != batch || out_dim != dim {
                    return Err(EmbedError::shape_mismatch(
                        "patch tokens batch/dim",
                        (batch, dim),
                        (out_batch, out_dim),
                    ));
                }
                Ok(Features::PatchGrid(patch_tokens_to_grid(
                    output.patch_tokens,
                    grid,
                )?))
            },
        }
    }
}

/// Split a backbone's `last_hidden_state` `(B, 1 + R + N, D)` into class and patch tokens
///
/// # Errors
/// - `ShapeMismatch` if the sequence is shorter than the class and register tokens
pub fn split_hidden_state(
    hidden: &Array3<f32>,
    register_tokens: usize,
) -> Result<BackboneOutput> {
    let (_, seq_len, _) = hidden.dim();
    let prefix = 1 + register_tokens;
    if seq_len < prefix {
        return Err(EmbedError::shape_mismatch(
            "hidden state sequence length (at least)",
            prefix,
            seq_len,
        ));
    }

    Ok(BackboneOutput {
        cls_tokens: hidden.slice(ndarray::s![.., 0, ..]).to_owned(),
        patch_tokens: hidden.slice(ndarray::s![.., prefix.., ..]).to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::MockBackbone;

    #[test]
    fn test_whole_image_mode_returns_cls_tokens() {
        let backbone = MockBackbone::new(16);
        let extractor = FeatureExtractor::new(&backbone);
        let images = Array4::<f32>::zeros((2, 3, 28, 42));

        let features = extractor
            .extract(
                &images,
                PatchGridDims { num_h: 2, num_w: 3 },
                ExtractionMode::WholeImage,
            )
            .unwrap();
        match features {
            Features::WholeImage(f) => assert_eq!(f.dim(), (2, 16)),
            Features::PatchGrid(_) => panic!("expected whole-image features"),
        }
        assert_eq!(backbone.call_count(), 1);
    }

    #[test]
    fn test_per_patch_mode_returns_grid() {
        let backbone = MockBackbone::new(8);
        let extractor = FeatureExtractor::new(&backbone);
        let images = Array4::<f32>::zeros((1, 3, 28, 42));

        let features = extractor
            .extract(
                &images,
                PatchGridDims { num_h: 2, num_w: 3 },
                ExtractionMode::PerPatch,
            )
            .unwrap();
        assert_eq!(features.batch_len(), 1);
        match features {
            Features::PatchGrid(f) => assert_eq!(f.dim(), (1, 2, 3, 8)),
            Features::WholeImage(_) => panic!("expected patch grid"),
        }
    }

    #[test]
    fn test_grid_disagreement_is_shape_mismatch() {
        let backbone = MockBackbone::new(8);
        let extractor = FeatureExtractor::new(&backbone);
        let images = Array4::<f32>::zeros((1, 3, 28, 42));

        let result = extractor.extract(
            &images,
            PatchGridDims { num_h: 3, num_w: 3 },
            ExtractionMode::PerPatch,
        );
        assert!(matches!(result, Err(EmbedError::ShapeMismatch(_))));
    }

    #[test]
    fn test_split_hidden_state_skips_registers() {
        let hidden = Array3::from_shape_fn((1, 1 + 4 + 6, 2), |(_, t, d)| (t * 10 + d) as f32);
        let output = split_hidden_state(&hidden, 4).unwrap();
        assert_eq!(output.cls_tokens.dim(), (1, 2));
        assert_eq!(output.patch_tokens.dim(), (1, 6, 2));
        assert_eq!(output.cls_tokens[[0, 1]], 1.0);
        assert_eq!(output.patch_tokens[[0, 0, 0]], 50.0);

        let short = Array3::<f32>::zeros((1, 3, 2));
        assert!(matches!(
            split_hidden_state(&short, 4),
            Err(EmbedError::ShapeMismatch(_))
        ));
    }
}
