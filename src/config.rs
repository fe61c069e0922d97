use std::path::PathBuf;

use anyhow::Result;
use clap_serde_derive::ClapSerde;

use crate::inference::vision_info::{
    FrameSamplingConfig, DEFAULT_FPS, FPS_MAX_FRAMES, FPS_MIN_FRAMES,
};

pub const DEFAULT_CONFIG_FILE: &str = "VideoReasoner.toml";
pub const DEFAULT_MODEL_ID: &str = "allenai/SAGE-MM-Qwen3-VL-4B-SFT_RL";

#[derive(ClapSerde, Debug, Clone)]
pub struct Config {
    /// The address the listener binds to
    #[default("0.0.0.0".to_string())]
    #[arg(short, long, env)]
    pub(crate) address: String,

    /// The port the listener binds to
    #[default(7860)]
    #[arg(short, long, env)]
    pub(crate) port: u16,

    /// The hub repository of the vision-language model
    #[default(DEFAULT_MODEL_ID.to_string())]
    #[arg(long, env)]
    pub(crate) model_id: String,

    /// The revision of the model repository
    #[default("main".to_string())]
    #[arg(long, env)]
    pub(crate) model_revision: String,

    /// Run on the CPU even when a GPU is available
    #[default(false)]
    #[arg(long, env)]
    pub(crate) cpu: bool,

    /// Seed of the token sampler
    #[default(299792458)]
    #[arg(long, env)]
    pub(crate) seed: u64,

    /// Directory holding the example videos shown on the page
    #[default("example-videos".to_string())]
    #[arg(long, env)]
    pub(crate) examples_dir: String,

    /// Directory where uploaded videos are stored while they are processed
    #[default(std::env::temp_dir().join("video_reasoner").to_string_lossy().into_owned())]
    #[arg(long, env)]
    pub(crate) upload_dir: String,

    /// Largest accepted request body, in bytes
    #[default(512 * 1024 * 1024)]
    #[arg(long, env)]
    pub(crate) max_upload_size: usize,

    /// Cache directory for hub downloads; the hub default when empty
    #[default(String::new())]
    #[arg(long, env)]
    pub(crate) hub_cache_dir: String,

    /// Chat template file replacing the built-in one
    #[default(String::new())]
    #[arg(long, env)]
    pub(crate) chat_template: String,

    /// Target frame sampling rate
    #[default(DEFAULT_FPS)]
    #[arg(long, env)]
    pub(crate) fps: f64,

    /// Fewest frames sampled from a video
    #[default(FPS_MIN_FRAMES)]
    #[arg(long, env)]
    pub(crate) min_frames: usize,

    /// Most frames sampled from a video
    #[default(FPS_MAX_FRAMES)]
    #[arg(long, env)]
    pub(crate) max_frames: usize,

    /// The ffmpeg binary used to decode frames
    #[default("ffmpeg".to_string())]
    #[arg(long, env)]
    pub(crate) ffmpeg: String,

    /// The ffprobe binary used to read video metadata
    #[default("ffprobe".to_string())]
    #[arg(long, env)]
    pub(crate) ffprobe: String,

    /// OTLP collector endpoint; telemetry is only exported when set
    #[default(String::new())]
    #[arg(long, env)]
    pub(crate) otlp_endpoint: String,

    /// Log to the console even when exporting telemetry
    #[default(false)]
    #[arg(long, env)]
    pub(crate) console: bool,
}

impl Config {
    /// Reads the options set in a TOML file. Options the file leaves out keep their defaults.
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let opt: <Self as ClapSerde>::Opt = toml::from_str(&str)?;
        Ok(Self::from(opt))
    }

    pub fn frame_sampling(&self) -> FrameSamplingConfig {
        FrameSamplingConfig {
            fps: self.fps,
            min_frames: self.min_frames,
            max_frames: self.max_frames,
            ffmpeg: self.ffmpeg.clone(),
            ffprobe: self.ffprobe.clone(),
            ..FrameSamplingConfig::default()
        }
    }

    pub fn chat_template_path(&self) -> Option<PathBuf> {
        (!self.chat_template.is_empty()).then(|| PathBuf::from(&self.chat_template))
    }

    pub fn hub_cache_dir(&self) -> Option<PathBuf> {
        (!self.hub_cache_dir.is_empty()).then(|| PathBuf::from(&self.hub_cache_dir))
    }

    pub fn otlp_endpoint(&self) -> Option<String> {
        (!self.otlp_endpoint.is_empty()).then(|| self.otlp_endpoint.clone())
    }
}
