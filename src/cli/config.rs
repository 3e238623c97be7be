//! Conversion of CLI arguments into an embedding job

use crate::cli::main_impl::Cli;
use crate::{
    backends::{parse_provider_string, BackendType},
    config::{DinoV2InferConfig, DinoV2InferIoConfig, DinoV2Size, EmbedderInferIoConfig},
    models::ModelSource,
};
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Everything the CLI needs to run one embedding job
#[derive(Debug)]
pub(crate) struct CliJob {
    pub(crate) job: DinoV2InferIoConfig,
    pub(crate) backend: BackendType,
    pub(crate) model_source: ModelSource,
}

pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Build the job from `--config` or from explicit flags
    ///
    /// Flags given next to `--config` override the file's values.
    pub(crate) fn from_cli(cli: &Cli) -> Result<CliJob> {
        let mut job = match &cli.config {
            Some(path) => DinoV2InferIoConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => DinoV2InferIoConfig {
                io: Self::io_from_flags(cli)?,
                model: DinoV2InferConfig::default(),
            },
        };
        Self::apply_overrides(cli, &mut job)?;

        let (backend, provider) =
            parse_provider_string(&cli.backend).context("Invalid --backend value")?;
        job.model.execution_provider = provider;
        if cli.threads > 0 {
            job.model.intra_threads = cli.threads;
            job.model.inter_threads = (cli.threads / 2).max(1);
        }
        job.model.validate().context("Invalid inference settings")?;

        let model_source = match &cli.model {
            Some(path) => ModelSource::External(path.clone()),
            None => ModelSource::default_for(job.model.size),
        };

        Ok(CliJob {
            job,
            backend,
            model_source,
        })
    }

    fn io_from_flags(cli: &Cli) -> Result<EmbedderInferIoConfig> {
        let required = |value: &Option<PathBuf>, flag: &str| {
            value
                .clone()
                .with_context(|| format!("{flag} is required when --config is not given"))
        };
        Ok(EmbedderInferIoConfig {
            coco_path: required(&cli.coco, "--coco")?,
            input_tiles_root: required(&cli.tiles_root, "--tiles-root")?,
            output_folder: required(&cli.output, "--output")?,
        })
    }

    fn apply_overrides(cli: &Cli, job: &mut DinoV2InferIoConfig) -> Result<()> {
        let model = &mut job.model;
        if let Some(size) = &cli.size {
            model.size = size.parse::<DinoV2Size>()?;
        }
        if let Some(profile) = &cli.profile {
            model.mean_std_descriptor.clone_from(profile);
        }
        if cli.no_normalize {
            model.normalize = false;
        }
        if cli.instance_normalization {
            model.instance_normalization = true;
        }
        if cli.whole_image {
            model.average_non_masked_patches = false;
        }
        if let Some(batch_size) = cli.batch_size {
            model.batch_size = batch_size;
        }
        if let Some(workers) = cli.workers {
            model.num_workers = workers;
        }

        if let Some(coco) = &cli.coco {
            job.io.coco_path.clone_from(coco);
        }
        if let Some(root) = &cli.tiles_root {
            job.io.input_tiles_root.clone_from(root);
        }
        if let Some(output) = &cli.output {
            job.io.output_folder.clone_from(output);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionProvider;
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("xprize-embed").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_build_job() {
        let cli = parse(&[
            "--coco",
            "a.json",
            "--tiles-root",
            "tiles",
            "--output",
            "out",
            "--size",
            "small",
            "--whole-image",
            "--batch-size",
            "4",
            "--backend",
            "tract:cpu",
        ]);
        let built = CliConfigBuilder::from_cli(&cli).unwrap();

        assert_eq!(built.job.io.coco_path, PathBuf::from("a.json"));
        assert_eq!(built.job.model.size, DinoV2Size::Small);
        assert!(!built.job.model.average_non_masked_patches);
        assert_eq!(built.job.model.batch_size, 4);
        assert_eq!(built.backend, BackendType::Tract);
        assert_eq!(built.job.model.execution_provider, ExecutionProvider::Cpu);
        assert_eq!(built.model_source, ModelSource::default_for(DinoV2Size::Small));
    }

    #[test]
    fn test_missing_paths_rejected() {
        let cli = parse(&["--coco", "a.json"]);
        let err = CliConfigBuilder::from_cli(&cli).unwrap_err();
        assert!(err.to_string().contains("--tiles-root"));
    }

    #[test]
    fn test_external_model_and_bad_backend() {
        let cli = parse(&[
            "--coco", "a.json", "--tiles-root", "t", "--output", "o", "--model", "m.onnx",
        ]);
        let built = CliConfigBuilder::from_cli(&cli).unwrap();
        assert_eq!(
            built.model_source,
            ModelSource::External(PathBuf::from("m.onnx"))
        );

        let cli = parse(&[
            "--coco", "a.json", "--tiles-root", "t", "--output", "o", "--backend", "tract:cuda",
        ]);
        assert!(CliConfigBuilder::from_cli(&cli).is_err());
    }
}
