//! Tract backbone, pure Rust inference on CPU

use crate::error::{EmbedError, Result};
use crate::inference::{split_hidden_state, BackboneOutput, FeatureBackbone};
use crate::models::{ModelInfo, ModelManager};
use instant::Instant;
use ndarray::{Array3, Array4};
use tract_onnx::prelude::*;

type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Frozen DINOv2 backbone executed by tract
#[derive(Debug)]
pub struct TractBackbone {
    model: TractModel,
    info: ModelInfo,
    name: String,
}

impl TractBackbone {
    #[must_use]
    pub fn list_providers() -> Vec<(String, bool, String)> {
        vec![(
            "CPU".to_string(),
            true,
            "Pure Rust CPU inference with no external dependencies".to_string(),
        )]
    }

    /// Parse and optimize the model resolved by `manager`
    ///
    /// # Errors
    /// - `ModelLoadFailure` if tract cannot read or optimize the graph
    pub fn new(manager: &ModelManager) -> Result<Self> {
        let load_start = Instant::now();
        let model_data = manager.load_model()?;
        let info = manager.info().clone();

        let model = onnx()
            .model_for_read(&mut std::io::Cursor::new(model_data))
            .map_err(|e| EmbedError::model_load(format!("Failed to load ONNX model: {e}")))?
            .into_optimized()
            .map_err(|e| EmbedError::model_load(format!("Failed to optimize model: {e}")))?
            .into_runnable()
            .map_err(|e| EmbedError::model_load(format!("Failed to create runnable model: {e}")))?;

        log::info!(
            "Tract backbone {} ready in {}ms",
            info.name,
            load_start.elapsed().as_millis()
        );
        Ok(Self {
            model,
            name: format!("tract:{}", info.name),
            info,
        })
    }

    #[must_use]
    pub fn info(&self) -> &ModelInfo {
        &self.info
    }
}

impl FeatureBackbone for TractBackbone {
    fn forward(&self, input: &Array4<f32>) -> Result<BackboneOutput> {
        let start = Instant::now();
        let contiguous = input.as_standard_layout();
        let data = contiguous
            .as_slice()
            .ok_or_else(|| EmbedError::internal("input batch is not contiguous"))?;
        let input_tensor = Tensor::from_shape(input.shape(), data)
            .map_err(|e| EmbedError::inference(format!("Failed to build input tensor: {e}")))?;

        let outputs = self
            .model
            .run(tvec![input_tensor.into()])
            .map_err(|e| EmbedError::inference(format!("Tract inference failed: {e}")))?;
        let output = outputs
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::inference("No output tensor found"))?;

        let shape = output.shape().to_vec();
        let [batch, tokens, dim] = shape[..] else {
            return Err(EmbedError::inference(format!(
                "Expected 3D hidden state, got shape {:?}",
                shape
            )));
        };
        let values = output
            .as_slice::<f32>()
            .map_err(|e| EmbedError::inference(format!("Failed to read output tensor: {e}")))?;
        let hidden = Array3::from_shape_vec((batch, tokens, dim), values.to_vec())
            .map_err(|e| EmbedError::inference(format!("Failed to reshape output tensor: {e}")))?;

        log::debug!(
            "Tract forward {:?} -> {:?} in {}ms",
            input.dim(),
            hidden.dim(),
            start.elapsed().as_millis()
        );
        split_hidden_state(&hidden, self.info.register_tokens)
    }

    fn embedding_dim(&self) -> usize {
        self.info.embedding_dim
    }

    fn patch_size(&self) -> usize {
        self.info.patch_size
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DinoV2Size;
    use crate::models::{ModelSource, ONNX_MODEL_FILE};
    use tempfile::TempDir;

    #[test]
    fn test_tract_lists_cpu_only() {
        let providers = TractBackbone::list_providers();
        assert_eq!(providers.len(), 1);
        assert!(providers[0].1);
    }

    #[test]
    fn test_garbage_model_is_load_failure() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("onnx")).unwrap();
        std::fs::write(temp.path().join(ONNX_MODEL_FILE), [0xffu8; 32]).unwrap();

        let manager =
            ModelManager::from_source(ModelSource::External(temp.path().into()), DinoV2Size::Small)
                .unwrap();
        assert!(matches!(
            TractBackbone::new(&manager),
            Err(EmbedError::ModelLoadFailure(_))
        ));
    }
}
