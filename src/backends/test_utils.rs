//! Mock backbone for exercising the pipeline without model files

use crate::{
    error::{EmbedError, Result},
    inference::{BackboneOutput, FeatureBackbone},
};
use ndarray::{Array2, Array3, Array4, Axis};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Deterministic stand-in for a DINOv2 backbone
///
/// Patch token `n` of every image holds `n + d / 100` in dimension `d`; the
/// class token holds the image mean plus `d`. The number of patch tokens is
/// derived from the input's spatial size and the patch size.
#[derive(Debug)]
pub struct MockBackbone {
    dim: usize,
    patch_size: usize,
    calls: AtomicUsize,
    should_fail: bool,
}

impl MockBackbone {
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            patch_size: 14,
            calls: AtomicUsize::new(0),
            should_fail: false,
        }
    }

    /// A backbone whose every forward pass fails
    #[must_use]
    pub fn failing(dim: usize) -> Self {
        Self {
            should_fail: true,
            ..Self::new(dim)
        }
    }

    /// Number of forward passes run so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Expected patch feature for token `n`, dimension `d`
    #[must_use]
    pub fn patch_value(n: usize, d: usize) -> f32 {
        n as f32 + d as f32 / 100.0
    }
}

impl FeatureBackbone for MockBackbone {
    fn forward(&self, input: &Array4<f32>) -> Result<BackboneOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail {
            return Err(EmbedError::inference("Mock backbone forward failed"));
        }

        let (batch, _, height, width) = input.dim();
        let tokens = (height / self.patch_size) * (width / self.patch_size);
        let patch_tokens =
            Array3::from_shape_fn((batch, tokens, self.dim), |(_, n, d)| Self::patch_value(n, d));

        let mut cls_tokens = Array2::<f32>::zeros((batch, self.dim));
        for (image, mut cls) in input.axis_iter(Axis(0)).zip(cls_tokens.outer_iter_mut()) {
            let mean = image.mean().unwrap_or(0.0);
            cls.indexed_iter_mut()
                .for_each(|(d, v)| *v = mean + d as f32);
        }

        Ok(BackboneOutput {
            cls_tokens,
            patch_tokens,
        })
    }

    fn embedding_dim(&self) -> usize {
        self.dim
    }

    fn patch_size(&self) -> usize {
        self.patch_size
    }

    fn name(&self) -> &str {
        "mock"
    }
}
