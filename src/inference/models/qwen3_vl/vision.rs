use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{layer_norm, linear, Activation, Embedding, LayerNorm, Linear, VarBuilder};
use tracing::debug;

use super::config::VisionConfig;
use super::rope::{inv_freq, pos_embed_bilinear, vision_patch_coords, vision_rotary_angles};

const VISION_ROPE_THETA: f64 = 10000.0;
const NORM_EPS: f64 = 1e-6;

/// A 3-D convolution whose kernel equals its stride, applied to pre-flattened patches, is a
/// plain linear layer over the flattened kernel.
struct PatchEmbed {
    proj: Linear,
}

impl PatchEmbed {
    fn new(config: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let (c, t, p) = (
            config.in_channels,
            config.temporal_patch_size,
            config.patch_size,
        );
        let weight = vb
            .get((config.hidden_size, c, t, p, p), "proj.weight")?
            .reshape((config.hidden_size, c * t * p * p))?;
        let bias = vb.get(config.hidden_size, "proj.bias")?;
        Ok(Self {
            proj: Linear::new(weight, Some(bias)),
        })
    }
}

impl Module for PatchEmbed {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.proj.forward(xs)
    }
}

struct VisionMlp {
    linear_fc1: Linear,
    linear_fc2: Linear,
    act: Activation,
}

impl VisionMlp {
    fn new(config: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear_fc1: linear(config.hidden_size, config.intermediate_size, vb.pp("linear_fc1"))?,
            linear_fc2: linear(config.intermediate_size, config.hidden_size, vb.pp("linear_fc2"))?,
            act: config.hidden_act,
        })
    }
}

impl Module for VisionMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.linear_fc2
            .forward(&self.act.forward(&self.linear_fc1.forward(xs)?)?)
    }
}

struct VisionAttention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl VisionAttention {
    fn new(config: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.hidden_size;
        Ok(Self {
            qkv: linear(dim, dim * 3, vb.pp("qkv"))?,
            proj: linear(dim, dim, vb.pp("proj"))?,
            num_heads: config.num_heads,
            head_dim: config.head_dim(),
        })
    }

    /// Attention restricted to each frame group, `chunks` being their lengths.
    fn forward(&self, xs: &Tensor, cos: &Tensor, sin: &Tensor, chunks: &[usize]) -> Result<Tensor> {
        let (seq_len, hidden_size) = xs.dims2()?;
        let dtype = xs.dtype();

        // (seq, 3, heads, head_dim) -> 3 x (1, heads, seq, head_dim)
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((seq_len, 3, self.num_heads, self.head_dim))?
            .permute((1, 2, 0, 3))?;
        let rotate = |x: Tensor| -> Result<Tensor> {
            let x = x.unsqueeze(0)?.to_dtype(DType::F32)?.contiguous()?;
            candle_nn::rotary_emb::rope(&x, cos, sin)?.to_dtype(dtype)
        };
        let q = rotate(qkv.get(0)?)?;
        let k = rotate(qkv.get(1)?)?;
        let v = qkv.get(2)?.unsqueeze(0)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut outputs = Vec::with_capacity(chunks.len());
        let mut offset = 0;
        for &len in chunks {
            let q = q.narrow(2, offset, len)?.contiguous()?;
            let k = k.narrow(2, offset, len)?.contiguous()?;
            let v = v.narrow(2, offset, len)?.contiguous()?;
            let att = (q.matmul(&k.t()?)? * scale)?;
            let att = candle_nn::ops::softmax_last_dim(&att.to_dtype(DType::F32)?)?.to_dtype(dtype)?;
            outputs.push(att.matmul(&v)?);
            offset += len;
        }

        let ys = Tensor::cat(&outputs, 2)?
            .squeeze(0)?
            .transpose(0, 1)?
            .reshape((seq_len, hidden_size))?;
        self.proj.forward(&ys)
    }
}

struct VisionBlock {
    norm1: LayerNorm,
    norm2: LayerNorm,
    attn: VisionAttention,
    mlp: VisionMlp,
}

impl VisionBlock {
    fn new(config: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: layer_norm(config.hidden_size, NORM_EPS, vb.pp("norm1"))?,
            norm2: layer_norm(config.hidden_size, NORM_EPS, vb.pp("norm2"))?,
            attn: VisionAttention::new(config, vb.pp("attn"))?,
            mlp: VisionMlp::new(config, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, xs: &Tensor, cos: &Tensor, sin: &Tensor, chunks: &[usize]) -> Result<Tensor> {
        let xs = (xs + self.attn.forward(&self.norm1.forward(xs)?, cos, sin, chunks)?)?;
        &xs + self.mlp.forward(&self.norm2.forward(&xs)?)?
    }
}

/// Concatenates each `merge x merge` block of patches and projects it to the text width.
struct PatchMerger {
    norm: LayerNorm,
    linear_fc1: Linear,
    linear_fc2: Linear,
    merged_size: usize,
    postshuffle_norm: bool,
}

impl PatchMerger {
    fn new(config: &VisionConfig, postshuffle_norm: bool, vb: VarBuilder) -> Result<Self> {
        let merged_size = config.hidden_size * config.spatial_merge_size.pow(2);
        let norm_size = if postshuffle_norm {
            merged_size
        } else {
            config.hidden_size
        };
        Ok(Self {
            norm: layer_norm(norm_size, NORM_EPS, vb.pp("norm"))?,
            linear_fc1: linear(merged_size, merged_size, vb.pp("linear_fc1"))?,
            linear_fc2: linear(merged_size, config.out_hidden_size, vb.pp("linear_fc2"))?,
            merged_size,
            postshuffle_norm,
        })
    }
}

impl Module for PatchMerger {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = if self.postshuffle_norm {
            self.norm.forward(&xs.reshape(((), self.merged_size))?)?
        } else {
            self.norm.forward(xs)?.reshape(((), self.merged_size))?
        };
        let xs = self.linear_fc1.forward(&xs)?.gelu_erf()?;
        self.linear_fc2.forward(&xs)
    }
}

/// Output of the vision tower: merged video tokens plus the intermediate features injected
/// into the first text layers.
pub struct VisionFeatures {
    pub embeds: Tensor,
    pub deepstack: Vec<Tensor>,
}

pub struct VisionModel {
    patch_embed: PatchEmbed,
    pos_embed: Embedding,
    blocks: Vec<VisionBlock>,
    merger: PatchMerger,
    deepstack_mergers: Vec<PatchMerger>,
    deepstack_indexes: Vec<usize>,
    rope_inv_freq: Vec<f32>,
    num_grid_per_side: usize,
    merge_size: usize,
}

impl VisionModel {
    pub fn new(config: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let blocks = (0..config.depth)
            .map(|i| VisionBlock::new(config, vb.pp(format!("blocks.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let deepstack_mergers = (0..config.deepstack_visual_indexes.len())
            .map(|i| PatchMerger::new(config, true, vb.pp(format!("deepstack_merger_list.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patch_embed: PatchEmbed::new(config, vb.pp("patch_embed"))?,
            pos_embed: candle_nn::embedding(
                config.num_position_embeddings,
                config.hidden_size,
                vb.pp("pos_embed"),
            )?,
            blocks,
            merger: PatchMerger::new(config, false, vb.pp("merger"))?,
            deepstack_mergers,
            deepstack_indexes: config.deepstack_visual_indexes.clone(),
            // two axes share the head: each gets a quarter of it as frequencies
            rope_inv_freq: inv_freq(config.head_dim() / 2, VISION_ROPE_THETA),
            num_grid_per_side: config.num_grid_per_side(),
            merge_size: config.spatial_merge_size,
        })
    }

    fn position_embeddings(&self, grid_thw: &[[usize; 3]], device: &Device) -> Result<Tensor> {
        let table = self.pos_embed.embeddings();
        let mut per_video = Vec::with_capacity(grid_thw.len());
        for &grid in grid_thw {
            let (indices, weights) = pos_embed_bilinear(grid, self.num_grid_per_side, self.merge_size);
            let mut sum: Option<Tensor> = None;
            for (index, weight) in indices.iter().zip(weights.iter()) {
                let index = Tensor::new(index.as_slice(), device)?;
                let weight = Tensor::new(weight.as_slice(), device)?
                    .to_dtype(table.dtype())?
                    .unsqueeze(1)?;
                let term = table.index_select(&index, 0)?.broadcast_mul(&weight)?;
                sum = Some(match sum {
                    Some(acc) => (acc + term)?,
                    None => term,
                });
            }
            if let Some(sum) = sum {
                per_video.push(sum);
            }
        }
        Tensor::cat(&per_video, 0)
    }

    fn rotary_cos_sin(&self, grid_thw: &[[usize; 3]], device: &Device) -> Result<(Tensor, Tensor)> {
        let coords: Vec<[usize; 2]> = grid_thw
            .iter()
            .flat_map(|&grid| vision_patch_coords(grid, self.merge_size))
            .collect();
        let width = self.rope_inv_freq.len() * 2;
        let angles = vision_rotary_angles(&coords, &self.rope_inv_freq);
        let angles = Tensor::from_vec(angles, (coords.len(), width), device)?;
        Ok((angles.cos()?, angles.sin()?))
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub fn forward(&self, pixel_values: &Tensor, grid_thw: &[[usize; 3]]) -> Result<VisionFeatures> {
        let device = pixel_values.device();
        let dtype = self.pos_embed.embeddings().dtype();

        let xs = self.patch_embed.forward(&pixel_values.to_dtype(dtype)?)?;
        let mut xs = (xs + self.position_embeddings(grid_thw, device)?)?;
        let (cos, sin) = self.rotary_cos_sin(grid_thw, device)?;
        let chunks: Vec<usize> = grid_thw
            .iter()
            .flat_map(|&[t, h, w]| std::iter::repeat(h * w).take(t))
            .collect();

        let mut deepstack = Vec::with_capacity(self.deepstack_mergers.len());
        for (layer, block) in self.blocks.iter().enumerate() {
            xs = block.forward(&xs, &cos, &sin, &chunks)?;
            if let Some(i) = self.deepstack_indexes.iter().position(|&l| l == layer) {
                deepstack.push(self.deepstack_mergers[i].forward(&xs)?);
            }
        }

        let embeds = self.merger.forward(&xs)?;
        debug!(
            "Encoded {} patches into {} video tokens",
            xs.dim(0)?,
            embeds.dim(0)?
        );
        Ok(VisionFeatures { embeds, deepstack })
    }
}
