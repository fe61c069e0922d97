use candle_nn::Activation;
use serde::Deserialize;

use crate::inference::model_config::TokenIds;

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RopeScaling {
    #[serde(default = "default_mrope_section")]
    pub mrope_section: [usize; 3],
}

fn default_mrope_section() -> [usize; 3] {
    [24, 20, 20]
}

impl Default for RopeScaling {
    fn default() -> Self {
        Self {
            mrope_section: default_mrope_section(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TextConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub head_dim: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    #[serde(default)]
    pub rope_scaling: RopeScaling,
    #[serde(default = "default_text_act")]
    pub hidden_act: Activation,
    #[serde(default)]
    pub attention_bias: bool,
    pub tie_word_embeddings: Option<bool>,
    pub eos_token_id: Option<TokenIds>,
}

fn default_text_act() -> Activation {
    Activation::Silu
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct VisionConfig {
    pub depth: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_heads: usize,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    pub patch_size: usize,
    pub spatial_merge_size: usize,
    pub temporal_patch_size: usize,
    pub out_hidden_size: usize,
    pub num_position_embeddings: usize,
    #[serde(default)]
    pub deepstack_visual_indexes: Vec<usize>,
    #[serde(default = "default_vision_act")]
    pub hidden_act: Activation,
}

fn default_in_channels() -> usize {
    3
}

fn default_vision_act() -> Activation {
    Activation::GeluPytorchTanh
}

impl VisionConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Side length of the square grid of learned position embeddings.
    pub fn num_grid_per_side(&self) -> usize {
        (self.num_position_embeddings as f64).sqrt() as usize
    }
}

/// `config.json` of a Qwen3-VL checkpoint.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Qwen3VlConfig {
    pub text_config: TextConfig,
    pub vision_config: VisionConfig,
    #[serde(default = "default_video_token_id")]
    pub video_token_id: u32,
    pub tie_word_embeddings: Option<bool>,
}

fn default_video_token_id() -> u32 {
    151656
}

impl Qwen3VlConfig {
    pub fn tie_word_embeddings(&self) -> bool {
        self.tie_word_embeddings
            .or(self.text_config.tie_word_embeddings)
            .unwrap_or(false)
    }
}
