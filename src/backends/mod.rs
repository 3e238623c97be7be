//! Inference engines able to run a DINOv2 backbone
//!
//! - ONNX Runtime (GPU acceleration through CUDA or CoreML)
//! - Tract (pure Rust, CPU only)

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "tract")]
pub mod tract;

#[cfg(test)]
pub mod test_utils;

#[cfg(feature = "onnx")]
pub use self::onnx::OnnxBackbone;

#[cfg(feature = "tract")]
pub use self::tract::TractBackbone;

use crate::config::{DinoV2InferConfig, ExecutionProvider};
use crate::error::{EmbedError, Result};
use crate::inference::FeatureBackbone;
use crate::models::ModelManager;

/// Inference engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    #[default]
    Onnx,
    Tract,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Onnx => write!(f, "onnx"),
            Self::Tract => write!(f, "tract"),
        }
    }
}

/// Parse `backend:provider` strings such as `onnx:auto` or `tract:cpu`
///
/// A bare backend name selects its default provider.
///
/// # Errors
/// - `InvalidConfig` for unknown backends or providers
pub fn parse_provider_string(provider_str: &str) -> Result<(BackendType, ExecutionProvider)> {
    let Some((backend, provider)) = provider_str.split_once(':') else {
        return match provider_str {
            "onnx" => Ok((BackendType::Onnx, ExecutionProvider::Auto)),
            "tract" => Ok((BackendType::Tract, ExecutionProvider::Cpu)),
            _ => Err(EmbedError::invalid_config(
                "Invalid provider format. Use backend:provider (e.g., onnx:auto, tract:cpu)",
            )),
        };
    };

    match backend {
        "onnx" => {
            let execution_provider = match provider {
                "auto" => ExecutionProvider::Auto,
                "cpu" => ExecutionProvider::Cpu,
                "cuda" => ExecutionProvider::Cuda,
                "coreml" => ExecutionProvider::CoreMl,
                _ => {
                    return Err(EmbedError::invalid_config(format!(
                        "Unknown ONNX provider: {}. Supported: auto, cpu, cuda, coreml",
                        provider
                    )))
                },
            };
            Ok((BackendType::Onnx, execution_provider))
        },
        "tract" if provider == "cpu" => Ok((BackendType::Tract, ExecutionProvider::Cpu)),
        "tract" => Err(EmbedError::invalid_config(format!(
            "Unknown Tract provider: {}. Tract only supports 'cpu'",
            provider
        ))),
        _ => Err(EmbedError::invalid_config(format!(
            "Unknown backend: {}. Supported backends: onnx, tract",
            backend
        ))),
    }
}

/// Load the backbone resolved by `manager` on the requested engine
///
/// # Errors
/// - `ModelLoadFailure` if the engine is not compiled in or rejects the model
pub fn load_backbone(
    backend: BackendType,
    manager: &ModelManager,
    config: &DinoV2InferConfig,
) -> Result<Box<dyn FeatureBackbone>> {
    log::info!(
        "Loading {} on {} ({})",
        manager.source().display_name(),
        backend,
        config.execution_provider
    );
    match backend {
        #[cfg(feature = "onnx")]
        BackendType::Onnx => Ok(Box::new(OnnxBackbone::new(manager, config)?)),
        #[cfg(feature = "tract")]
        BackendType::Tract => Ok(Box::new(TractBackbone::new(manager)?)),
        #[allow(unreachable_patterns)]
        other => Err(EmbedError::model_load(format!(
            "{} backend is not enabled in this build",
            other
        ))),
    }
}
