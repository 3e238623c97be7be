//! ONNX Runtime backbone
//!
//! Runs a DINOv2-with-registers ONNX export whose first output is
//! `last_hidden_state` with shape `(B, 1 + R + N, D)`.

use crate::config::{DinoV2InferConfig, ExecutionProvider};
use crate::error::{EmbedError, Result};
use crate::inference::{split_hidden_state, BackboneOutput, FeatureBackbone};
use crate::models::{ModelInfo, ModelManager};
use instant::Instant;
use ndarray::{Array4, Ix3};
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
    ExecutionProviderDispatch,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use std::sync::Mutex;

const HIDDEN_STATE_OUTPUT: &str = "last_hidden_state";

/// Frozen DINOv2 backbone executed by ONNX Runtime
///
/// The session sits behind a mutex so the backbone can be shared read-only
/// while ONNX Runtime still gets exclusive access per run.
#[derive(Debug)]
pub struct OnnxBackbone {
    session: Mutex<Session>,
    info: ModelInfo,
    name: String,
}

impl OnnxBackbone {
    /// List execution providers with their availability
    #[must_use]
    pub fn list_providers() -> Vec<(String, bool, String)> {
        vec![
            (
                "CPU".to_string(),
                true,
                "Always available, uses CPU for inference".to_string(),
            ),
            (
                "CUDA".to_string(),
                OrtExecutionProvider::is_available(&CUDAExecutionProvider::default())
                    .unwrap_or(false),
                "NVIDIA GPU acceleration (requires CUDA toolkit and compatible GPU)".to_string(),
            ),
            (
                "CoreML".to_string(),
                OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default())
                    .unwrap_or(false),
                "Apple Silicon GPU acceleration (macOS only)".to_string(),
            ),
        ]
    }

    /// Load the model resolved by `manager` into a new session
    ///
    /// # Errors
    /// - `ModelLoadFailure` if the file cannot be read or ONNX Runtime rejects it
    pub fn new(manager: &ModelManager, config: &DinoV2InferConfig) -> Result<Self> {
        let load_start = Instant::now();
        let model_data = manager.load_model()?;

        let mut builder = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .map_err(|e| EmbedError::model_load(format!("Failed to create session builder: {e}")))?;

        let providers = Self::execution_providers(config.execution_provider);
        if !providers.is_empty() {
            builder = builder.with_execution_providers(providers).map_err(|e| {
                EmbedError::model_load(format!("Failed to set execution providers: {e}"))
            })?;
        }

        let cores = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(8);
        let intra_threads = if config.intra_threads > 0 {
            config.intra_threads
        } else {
            cores
        };
        let inter_threads = if config.inter_threads > 0 {
            config.inter_threads
        } else {
            (cores / 4).max(1)
        };

        let session = builder
            .with_intra_threads(intra_threads)
            .and_then(|b| b.with_inter_threads(inter_threads))
            .and_then(|mut b| b.commit_from_memory(&model_data))
            .map_err(|e| {
                EmbedError::model_load(format!(
                    "Failed to create session from {}: {e}",
                    manager.model_path().display()
                ))
            })?;

        let info = manager.info().clone();
        log::debug!(
            "ONNX session ready: {} ({:.1} MB), {} intra / {} inter threads, provider {}",
            info.name,
            info.size_bytes as f64 / (1024.0 * 1024.0),
            intra_threads,
            inter_threads,
            config.execution_provider
        );
        log::info!(
            "Loaded {} in {:.0}ms",
            info.name,
            load_start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(Self {
            session: Mutex::new(session),
            name: format!("onnx:{}", info.name),
            info,
        })
    }

    fn execution_providers(requested: ExecutionProvider) -> Vec<ExecutionProviderDispatch> {
        let cuda_available =
            || OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false);
        let coreml_available = || {
            OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default())
                .unwrap_or(false)
        };

        let mut providers = Vec::new();
        match requested {
            ExecutionProvider::Auto => {
                if cuda_available() {
                    log::info!("CUDA execution provider is available and will be used");
                    providers.push(CUDAExecutionProvider::default().build());
                }
                if coreml_available() {
                    log::info!("CoreML execution provider is available and will be used");
                    providers.push(CoreMLExecutionProvider::default().with_subgraphs(true).build());
                }
                if providers.is_empty() {
                    log::warn!("No hardware acceleration available, falling back to CPU");
                }
            },
            ExecutionProvider::Cpu => log::info!("Using CPU execution provider"),
            ExecutionProvider::Cuda => {
                if cuda_available() {
                    providers.push(CUDAExecutionProvider::default().build());
                } else {
                    log::warn!("CUDA requested but not available, falling back to CPU");
                }
            },
            ExecutionProvider::CoreMl => {
                if coreml_available() {
                    providers.push(CoreMLExecutionProvider::default().with_subgraphs(true).build());
                } else {
                    log::warn!("CoreML requested but not available, falling back to CPU");
                }
            },
        }
        providers
    }

    #[must_use]
    pub fn info(&self) -> &ModelInfo {
        &self.info
    }
}

impl FeatureBackbone for OnnxBackbone {
    fn forward(&self, input: &Array4<f32>) -> Result<BackboneOutput> {
        let start = Instant::now();
        let input_value = Value::from_array(input.clone())
            .map_err(|e| EmbedError::inference(format!("Failed to convert input tensor: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| EmbedError::internal("ONNX session lock poisoned"))?;
        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| EmbedError::inference(format!("ONNX inference failed: {e}")))?;

        let hidden_value = match outputs.get(HIDDEN_STATE_OUTPUT) {
            Some(value) => value,
            None => {
                let first = outputs
                    .keys()
                    .next()
                    .ok_or_else(|| EmbedError::inference("No output tensors found"))?;
                log::debug!("No '{HIDDEN_STATE_OUTPUT}' output, using first output '{first}'");
                outputs
                    .get(first)
                    .ok_or_else(|| EmbedError::inference("First output tensor not found"))?
            },
        };

        let hidden = hidden_value
            .try_extract_array::<f32>()
            .map_err(|e| EmbedError::inference(format!("Failed to extract output tensor: {e}")))?
            .to_owned()
            .into_dimensionality::<Ix3>()
            .map_err(|e| EmbedError::inference(format!("Expected 3D hidden state: {e}")))?;

        log::debug!(
            "ONNX forward {:?} -> {:?} in {:.2}ms",
            input.dim(),
            hidden.dim(),
            start.elapsed().as_secs_f64() * 1000.0
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
