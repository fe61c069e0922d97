use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Result};
use candle_core::{Device, Tensor};
use hf_hub::api::sync::ApiRepo;
use serde::Deserialize;
use thiserror::Error;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::inference::chat_template::ChatTemplate;
use crate::inference::message::Message;
use crate::inference::vision_info::{VideoFrames, VideoKwargs, VideoMetadata};

pub const INPUT_IDS: &str = "input_ids";
pub const ATTENTION_MASK: &str = "attention_mask";
pub const PIXEL_VALUES_VIDEOS: &str = "pixel_values_videos";
pub const VIDEO_GRID_THW: &str = "video_grid_thw";

const PLACEHOLDER: &str = "<|placeholder|>";

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Tokenizer(#[from] tokenizers::Error),

    #[error(transparent)]
    Template(#[from] minijinja::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("video has no frames")]
    EmptyVideo,

    #[error("frame size {width}x{height} is not a multiple of {factor}")]
    FrameSize {
        height: usize,
        width: usize,
        factor: usize,
    },

    #[error("mismatched video count: placeholders = {placeholders}, videos = {videos}")]
    MismatchedVideoCount { placeholders: usize, videos: usize },

    #[error("mismatched metadata count: videos = {videos}, metadata = {metadata}")]
    MismatchedMetadata { videos: usize, metadata: usize },

    #[error("expected {expected} frame timestamps, got {actual}")]
    TimestampCount { expected: usize, actual: usize },

    #[error("unsupported video option: {0}")]
    UnsupportedOption(String),
}

/// Named tensors consumed by the model.
#[derive(Debug, Clone, Default)]
pub struct ModelInputs {
    tensors: BTreeMap<String, Tensor>,
}

impl ModelInputs {
    pub fn insert(&mut self, name: &str, tensor: Tensor) {
        self.tensors.insert(name.to_string(), tensor);
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| anyhow!("missing model input {name}"))
    }

    pub fn get_opt(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn to_device(self, device: &Device) -> candle_core::Result<Self> {
        let tensors = self
            .tensors
            .into_iter()
            .map(|(name, tensor)| Ok((name, tensor.to_device(device)?)))
            .collect::<candle_core::Result<_>>()?;
        Ok(Self { tensors })
    }

    /// Length of the prompt, i.e. where generated tokens start in the model output.
    pub fn input_len(&self) -> Result<usize> {
        Ok(self.get(INPUT_IDS)?.dim(1)?)
    }
}

pub struct ProcessorInput<'a> {
    pub videos: &'a [VideoFrames],
    pub video_metadata: &'a [VideoMetadata],
    pub text: &'a str,
    pub padding: bool,
    pub video_kwargs: &'a VideoKwargs,
}

/// Turns messages and sampled videos into model inputs and decodes model output.
pub trait MultimodalProcessor: Send + Sync {
    fn apply_chat_template(&self, messages: &[Message], add_generation_prompt: bool)
        -> Result<String>;

    fn process(&self, input: ProcessorInput<'_>) -> Result<ModelInputs>;

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String>;
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct VideoProcessorConfig {
    pub patch_size: usize,
    pub temporal_patch_size: usize,
    pub merge_size: usize,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub rescale_factor: f32,
}

impl Default for VideoProcessorConfig {
    fn default() -> Self {
        Self {
            patch_size: 16,
            temporal_patch_size: 2,
            merge_size: 2,
            image_mean: [0.5, 0.5, 0.5],
            image_std: [0.5, 0.5, 0.5],
            rescale_factor: 1.0 / 255.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VisionTokens {
    pub video: String,
    pub vision_start: String,
    pub vision_end: String,
}

impl Default for VisionTokens {
    fn default() -> Self {
        Self {
            video: "<|video_pad|>".into(),
            vision_start: "<|vision_start|>".into(),
            vision_end: "<|vision_end|>".into(),
        }
    }
}

/// One timestamp per temporal patch: the mean time of the frames merged into it.
pub fn calculate_timestamps(indices: &[usize], fps: f64, merge_size: usize) -> Vec<f64> {
    let Some(&last) = indices.last() else {
        return Vec::new();
    };
    let mut indices = indices.to_vec();
    let remainder = indices.len() % merge_size;
    if remainder != 0 {
        indices.extend(std::iter::repeat(last).take(merge_size - remainder));
    }
    indices
        .chunks(merge_size)
        .map(|chunk| (chunk[0] as f64 / fps + chunk[chunk.len() - 1] as f64 / fps) / 2.0)
        .collect()
}

/// Normalises the frames and flattens them into patches ordered the way the vision encoder
/// merges them: for every temporal patch, blocks of `merge_size x merge_size` neighbouring
/// patches in row-major order. Each patch row is laid out as `channel, time, y, x`.
pub fn patchify(
    frames: &VideoFrames,
    config: &VideoProcessorConfig,
) -> Result<(Vec<f32>, [usize; 3]), ProcessorError> {
    if frames.num_frames == 0 {
        return Err(ProcessorError::EmptyVideo);
    }
    let p = config.patch_size;
    let m = config.merge_size;
    let tp = config.temporal_patch_size;
    let factor = p * m;
    if frames.height % factor != 0 || frames.width % factor != 0 {
        return Err(ProcessorError::FrameSize {
            height: frames.height,
            width: frames.width,
            factor,
        });
    }

    let grid_t = frames.num_frames.div_ceil(tp);
    let grid_h = frames.height / p;
    let grid_w = frames.width / p;
    let row_len = 3 * tp * p * p;
    let mut out = Vec::with_capacity(grid_t * grid_h * grid_w * row_len);

    // the last frame is repeated to fill the final temporal patch
    let frame_at = |t: usize| frames.frame(t.min(frames.num_frames - 1));
    let scale: [f32; 3] = std::array::from_fn(|c| config.rescale_factor / config.image_std[c]);
    let shift: [f32; 3] = std::array::from_fn(|c| config.image_mean[c] / config.image_std[c]);

    for t in 0..grid_t {
        for bh in 0..grid_h / m {
            for bw in 0..grid_w / m {
                for ih in 0..m {
                    for iw in 0..m {
                        let y0 = (bh * m + ih) * p;
                        let x0 = (bw * m + iw) * p;
                        for c in 0..3 {
                            for tt in 0..tp {
                                let frame = frame_at(t * tp + tt);
                                for py in 0..p {
                                    let row = (y0 + py) * frames.width;
                                    for px in 0..p {
                                        let value = frame[(row + x0 + px) * 3 + c] as f32;
                                        out.push(value * scale[c] - shift[c]);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Ok((out, [grid_t, grid_h, grid_w]))
}

/// Replaces each video placeholder of `text` with one timestamped vision block per temporal
/// patch, each holding `h * w / merge_length` video tokens.
pub fn expand_video_placeholders(
    text: &str,
    videos: &[([usize; 3], Vec<f64>)],
    merge_length: usize,
    tokens: &VisionTokens,
) -> Result<String, ProcessorError> {
    let full_placeholder = format!("{}{}{}", tokens.vision_start, tokens.video, tokens.vision_end);
    let placeholders = text.matches(tokens.video.as_str()).count();
    if placeholders != videos.len() {
        return Err(ProcessorError::MismatchedVideoCount {
            placeholders,
            videos: videos.len(),
        });
    }

    let mut text = text.to_string();
    for ([grid_t, grid_h, grid_w], timestamps) in videos {
        if timestamps.len() != *grid_t {
            return Err(ProcessorError::TimestampCount {
                expected: *grid_t,
                actual: timestamps.len(),
            });
        }
        let frame_seqlen = grid_h * grid_w / merge_length;
        let mut expanded = String::new();
        for timestamp in timestamps {
            expanded.push_str(&format!("<{timestamp:.1} seconds>"));
            expanded.push_str(&tokens.vision_start);
            expanded.push_str(&PLACEHOLDER.repeat(frame_seqlen));
            expanded.push_str(&tokens.vision_end);
        }
        text = if text.contains(&full_placeholder) {
            text.replacen(&full_placeholder, &expanded, 1)
        } else {
            text.replacen(&tokens.video, &expanded, 1)
        };
    }
    Ok(text.replace(PLACEHOLDER, &tokens.video))
}

/// Processor for Qwen3-VL checkpoints.
pub struct Qwen3VlProcessor {
    tokenizer: Tokenizer,
    template: ChatTemplate,
    config: VideoProcessorConfig,
    tokens: VisionTokens,
}

impl Qwen3VlProcessor {
    pub fn new(tokenizer: Tokenizer, template: ChatTemplate, config: VideoProcessorConfig) -> Self {
        Self {
            tokenizer,
            template,
            config,
            tokens: VisionTokens::default(),
        }
    }

    #[tracing::instrument(level = "info", skip(repo))]
    pub fn load(repo: &ApiRepo, chat_template: Option<&Path>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(repo.get("tokenizer.json")?)
            .map_err(ProcessorError::Tokenizer)?;

        let config = match repo
            .get("video_preprocessor_config.json")
            .or_else(|_| repo.get("preprocessor_config.json"))
        {
            Ok(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            Err(err) => {
                debug!("No preprocessor config found, using defaults: {err}");
                VideoProcessorConfig::default()
            }
        };

        let template = match chat_template {
            Some(path) => ChatTemplate::from_file(path)?,
            None => ChatTemplate::qwen3_vl()?,
        };
        Ok(Self::new(tokenizer, template, config))
    }
}

impl MultimodalProcessor for Qwen3VlProcessor {
    fn apply_chat_template(
        &self,
        messages: &[Message],
        add_generation_prompt: bool,
    ) -> Result<String> {
        Ok(self.template.render(messages, add_generation_prompt)?)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    fn process(&self, input: ProcessorInput<'_>) -> Result<ModelInputs> {
        if input.videos.len() != input.video_metadata.len() {
            return Err(ProcessorError::MismatchedMetadata {
                videos: input.videos.len(),
                metadata: input.video_metadata.len(),
            }
            .into());
        }
        if let Some(true) = input
            .video_kwargs
            .get("do_sample_frames")
            .and_then(|v| v.as_bool())
        {
            return Err(ProcessorError::UnsupportedOption(
                "do_sample_frames: frames must be sampled before processing".into(),
            )
            .into());
        }
        let fallback_fps: Vec<f64> = input
            .video_kwargs
            .get("fps")
            .and_then(|v| v.as_array())
            .map(|values| values.iter().filter_map(|v| v.as_f64()).collect())
            .unwrap_or_default();

        let mut pixel_values = Vec::new();
        let mut grids = Vec::with_capacity(input.videos.len());
        let mut expansions = Vec::with_capacity(input.videos.len());
        for (index, (frames, metadata)) in input
            .videos
            .iter()
            .zip(input.video_metadata.iter())
            .enumerate()
        {
            debug!(
                "video {index}: {} of {} frames ({:.1}s, {}x{} source) via {}, decoded {:?}",
                metadata.frames_indices.len(),
                metadata.total_num_frames,
                metadata.duration,
                metadata.width,
                metadata.height,
                metadata.video_backend,
                [frames.num_frames, frames.height, frames.width],
            );
            let (patches, grid) = patchify(frames, &self.config)?;
            let fps = if metadata.fps > 0.0 {
                metadata.fps
            } else {
                fallback_fps.get(index).copied().unwrap_or(1.0)
            };
            let timestamps = calculate_timestamps(
                &metadata.frames_indices,
                fps,
                self.config.temporal_patch_size,
            );
            pixel_values.extend(patches);
            grids.push(grid);
            expansions.push((grid, timestamps));
        }

        let merge_length = self.config.merge_size * self.config.merge_size;
        let text = expand_video_placeholders(input.text, &expansions, merge_length, &self.tokens)?;
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(ProcessorError::Tokenizer)?;
        let ids = encoding.get_ids();
        let attention_mask = if input.padding {
            encoding.get_attention_mask().to_vec()
        } else {
            vec![1; ids.len()]
        };
        debug!("Prompt expanded to {} tokens", ids.len());

        let device = Device::Cpu;
        let mut inputs = ModelInputs::default();
        inputs.insert(INPUT_IDS, Tensor::new(ids, &device)?.unsqueeze(0)?);
        inputs.insert(
            ATTENTION_MASK,
            Tensor::new(attention_mask.as_slice(), &device)?.unsqueeze(0)?,
        );
        if !grids.is_empty() {
            let row_len = 3
                * self.config.temporal_patch_size
                * self.config.patch_size
                * self.config.patch_size;
            let rows = pixel_values.len() / row_len;
            inputs.insert(
                PIXEL_VALUES_VIDEOS,
                Tensor::from_vec(pixel_values, (rows, row_len), &device)?,
            );
            let flat: Vec<u32> = grids.iter().flatten().map(|&v| v as u32).collect();
            inputs.insert(
                VIDEO_GRID_THW,
                Tensor::from_vec(flat, (grids.len(), 3), &device)?,
            );
        }
        Ok(inputs)
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String> {
        Ok(self
            .tokenizer
            .decode(tokens, skip_special_tokens)
            .map_err(ProcessorError::Tokenizer)?)
    }
}
