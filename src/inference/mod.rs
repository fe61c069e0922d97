use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use tracing::info;

use crate::config::Config;
use crate::inference::handler::VideoHandler;
use crate::inference::models::model::ModelBase;
use crate::inference::models::qwen3_vl::Qwen3VlModel;
use crate::inference::processor::Qwen3VlProcessor;
use crate::inference::vision_info::FfmpegVisionExtractor;

pub mod chat_template;
pub mod handler;
pub mod message;
pub mod model_config;
pub mod models;
pub mod processor;
pub mod vision_info;

pub fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    Ok(Device::cuda_if_available(0)?)
}

/// Half precision on accelerators, full precision on the CPU.
pub fn select_dtype(device: &Device) -> DType {
    if device.is_cuda() {
        DType::BF16
    } else {
        DType::F32
    }
}

/// Hub client using the configured cache directory, or the default one.
pub fn hub_api(config: &Config) -> Result<Api> {
    let mut builder = ApiBuilder::new();
    if let Some(cache_dir) = config.hub_cache_dir() {
        builder = builder.with_cache_dir(cache_dir);
    }
    builder.build().context("Failed to create hub API")
}

/// Downloads (or reuses the cached) model repository and builds the handler serving it.
/// Called once at startup; any failure means the server must not start.
pub fn load_video_handler(config: &Config, api: &Api) -> Result<(VideoHandler, ModelBase)> {
    let model = ModelBase::from_repo(&config.model_id, &config.model_revision);
    let repo = api.repo(Repo::with_revision(
        model.repo_id.clone(),
        RepoType::Model,
        model.repo_revision.clone(),
    ));

    let device = select_device(config.cpu)?;
    let dtype = select_dtype(&device);
    info!("Loading {} on {device:?} as {dtype:?}", model.repo_id);

    let processor = Qwen3VlProcessor::load(&repo, config.chat_template_path().as_deref())
        .with_context(|| format!("Failed to load the processor of {}", model.repo_id))?;
    let vlm = Qwen3VlModel::load(&repo, &device, dtype, Some(config.seed))
        .with_context(|| format!("Failed to load the model {}", model.repo_id))?;
    let extractor = FfmpegVisionExtractor::new(config.frame_sampling());

    let handler = VideoHandler::new(Arc::new(extractor), Arc::new(processor), Arc::new(vlm));
    Ok((handler, model))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_runs_in_full_precision() {
        let device = select_device(true).unwrap();
        assert!(device.is_cpu());
        assert_eq!(select_dtype(&device), DType::F32);
    }

    #[test]
    fn unknown_model_fails_to_load() {
        let cache = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.model_id = "not-a/real-model".to_string();
        config.cpu = true;
        config.hub_cache_dir = cache.path().to_string_lossy().into_owned();

        let api = hub_api(&config).unwrap();
        // the hub answers 404, or cannot be reached at all: both must fail
        let err = load_video_handler(&config, &api).err().unwrap();
        assert!(format!("{err:#}").contains("not-a/real-model"));
    }
}
