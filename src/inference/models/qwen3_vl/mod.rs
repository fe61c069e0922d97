//! Qwen3-VL: a ViT video encoder feeding a Qwen3 decoder with multimodal rotary positions.

mod config;
mod rope;
mod text;
mod vision;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};
use hf_hub::api::sync::ApiRepo;
use tracing::{debug, info};

pub use config::Qwen3VlConfig;

use self::rope::rope_index;
use self::text::{Deepstack, KvCache, TextModel};
use self::vision::VisionModel;
use crate::inference::model_config::{GenerationConfig, TokenIds};
use crate::inference::models::model::VisionLanguageModel;
use crate::inference::processor::{ModelInputs, INPUT_IDS, PIXEL_VALUES_VIDEOS, VIDEO_GRID_THW};

pub struct Qwen3VlModel {
    vision: VisionModel,
    text: TextModel,
    lm_head: Linear,
    generation: GenerationConfig,
    eos_token_ids: Vec<u32>,
    video_token_id: u32,
    merge_size: usize,
    device: Device,
}

impl Qwen3VlModel {
    pub fn new(config: &Qwen3VlConfig, generation: GenerationConfig, vb: VarBuilder) -> Result<Self> {
        let vision = VisionModel::new(&config.vision_config, vb.pp("model.visual"))?;
        let text = TextModel::new(&config.text_config, vb.pp("model.language_model"))?;
        let lm_head = if config.tie_word_embeddings() {
            Linear::new(text.embed_tokens().embeddings().clone(), None)
        } else {
            linear_no_bias(
                config.text_config.hidden_size,
                config.text_config.vocab_size,
                vb.pp("lm_head"),
            )?
        };

        let mut eos_token_ids = generation.eos_token_ids();
        if eos_token_ids.is_empty() {
            eos_token_ids = match &config.text_config.eos_token_id {
                Some(TokenIds::Single(id)) => vec![*id],
                Some(TokenIds::Many(ids)) => ids.clone(),
                None => bail!("No end-of-sequence token configured"),
            };
        }

        Ok(Self {
            vision,
            text,
            lm_head,
            generation,
            eos_token_ids,
            video_token_id: config.video_token_id,
            merge_size: config.vision_config.spatial_merge_size,
            device: vb.device().clone(),
        })
    }

    /// Loads config, generation defaults and safetensors weights from a hub repository.
    #[tracing::instrument(level = "info", skip(repo, device))]
    pub fn load(repo: &ApiRepo, device: &Device, dtype: DType, seed: Option<u64>) -> Result<Self> {
        let config: Qwen3VlConfig =
            serde_json::from_str(&std::fs::read_to_string(repo.get("config.json")?)?)?;
        let mut generation = GenerationConfig::load(repo)?;
        generation.seed = seed.or(generation.seed);

        let filenames = weight_files(repo)?;
        debug!("Loading weights from {} files", filenames.len());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&filenames, dtype, device)? };
        Self::new(&config, generation, vb)
    }

    fn logits(&self, hidden: &Tensor) -> Result<Tensor> {
        let last = TextModel::last_hidden(hidden)?;
        Ok(self
            .lm_head
            .forward(&last)?
            .squeeze(0)?
            .to_dtype(DType::F32)?)
    }
}

impl VisionLanguageModel for Qwen3VlModel {
    fn device(&self) -> &Device {
        &self.device
    }

    #[tracing::instrument(level = "info", skip(self, inputs))]
    fn generate(&self, inputs: &ModelInputs, max_new_tokens: usize) -> Result<Vec<u32>> {
        let input_ids = inputs.get(INPUT_IDS)?;
        let prompt: Vec<u32> = input_ids.squeeze(0)?.to_vec1()?;
        if prompt.is_empty() {
            bail!("Prompt is empty");
        }

        let mut embeds = self.text.embed(input_ids)?;
        let mut grids = Vec::new();
        let mut video = None;
        if let Some(pixel_values) = inputs.get_opt(PIXEL_VALUES_VIDEOS) {
            grids = video_grids(inputs.get(VIDEO_GRID_THW)?)?;
            let features = self.vision.forward(pixel_values, &grids)?;
            let positions: Vec<u32> = prompt
                .iter()
                .enumerate()
                .filter(|(_, id)| **id == self.video_token_id)
                .map(|(i, _)| i as u32)
                .collect();
            let num_features = features.embeds.dim(0)?;
            if positions.len() != num_features {
                bail!(
                    "Video features and video tokens do not match: tokens = {}, features = {num_features}",
                    positions.len()
                );
            }
            embeds = scatter_rows(&embeds.squeeze(0)?, &features.embeds, &positions)?.unsqueeze(0)?;
            let positions = Tensor::new(positions.as_slice(), &self.device)?;
            video = Some((positions, features.deepstack));
        }

        let (positions, delta) = rope_index(&prompt, &grids, self.video_token_id, self.merge_size)?;
        let deepstack = video
            .as_ref()
            .map(|(positions, embeds)| Deepstack { positions, embeds });

        let mut cache = KvCache::new(self.text.num_layers());
        let mut logits_processor = self.generation.logits_processor();
        let repeat_penalty = self.generation.repeat_penalty;
        let repeat_context_size = self.generation.repeat_context_size;
        let mut tokens = prompt.clone();

        let start_gen = Instant::now();
        let hidden = self
            .text
            .forward(&embeds, &positions, &mut cache, deepstack.as_ref())?;
        let mut logits = self.logits(&hidden)?;
        for index in 0..max_new_tokens {
            let penalized = if (repeat_penalty - 1.).abs() < f32::EPSILON {
                logits
            } else {
                let start_at = tokens.len().saturating_sub(repeat_context_size);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    repeat_penalty,
                    &tokens[start_at..],
                )?
            };

            let next_token = logits_processor.sample(&penalized)?;
            tokens.push(next_token);
            if self.eos_token_ids.contains(&next_token) || index + 1 == max_new_tokens {
                break;
            }

            // decoding continues from the prompt's last multimodal position on all axes
            let position = (prompt.len() + index) as i64 + delta;
            let input = Tensor::new(&[next_token], &self.device)?.unsqueeze(0)?;
            let hidden = self.text.forward(
                &self.text.embed(&input)?,
                &[[position; 3]],
                &mut cache,
                None,
            )?;
            logits = self.logits(&hidden)?;
        }

        info!(
            "Generated {} tokens in {:.2}s",
            tokens.len() - prompt.len(),
            start_gen.elapsed().as_secs_f64()
        );
        Ok(tokens)
    }
}

fn video_grids(grid_thw: &Tensor) -> Result<Vec<[usize; 3]>> {
    grid_thw
        .to_vec2::<u32>()?
        .into_iter()
        .map(|row| match row.as_slice() {
            &[t, h, w] => Ok([t as usize, h as usize, w as usize]),
            _ => bail!("video_grid_thw rows must hold three values"),
        })
        .collect()
}

/// Replaces the rows of `base` at `positions` with the rows of `rows`, in order.
fn scatter_rows(base: &Tensor, rows: &Tensor, positions: &[u32]) -> Result<Tensor> {
    let len = base.dim(0)?;
    let mut index: Vec<u32> = (0..len as u32).collect();
    for (k, &position) in positions.iter().enumerate() {
        index[position as usize] = (len + k) as u32;
    }
    let index = Tensor::new(index.as_slice(), base.device())?;
    Ok(Tensor::cat(&[base, rows], 0)?.index_select(&index, 0)?)
}

/// Shard names listed in a `model.safetensors.index.json`.
fn weight_shards(index: &str) -> Result<Vec<String>> {
    let index: serde_json::Value = serde_json::from_str(index)?;
    let Some(weight_map) = index.get("weight_map").and_then(|m| m.as_object()) else {
        bail!("Invalid safetensors index: missing weight_map");
    };
    let shards: BTreeSet<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
    Ok(shards.into_iter().map(String::from).collect())
}

fn weight_files(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    match repo.get("model.safetensors.index.json") {
        Ok(index) => weight_shards(&std::fs::read_to_string(index)?)?
            .iter()
            .map(|shard| repo.get(shard).map_err(anyhow::Error::from))
            .collect(),
        Err(_) => Ok(vec![repo.get("model.safetensors")?]),
    }
}
