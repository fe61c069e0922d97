use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{
    linear_b, linear_no_bias, rms_norm, rotary_emb::rope, Activation, Embedding, Linear, RmsNorm,
    VarBuilder,
};
use candle_transformers::utils::repeat_kv;

use super::config::TextConfig;
use super::rope::{inv_freq, mrope_cos_sin, MropePosition};

/// Keys and values of every decoder layer for one generation request.
pub struct KvCache {
    layers: Vec<Option<(Tensor, Tensor)>>,
}

impl KvCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![None; num_layers],
        }
    }

    pub fn seq_len(&self) -> usize {
        self.layers
            .first()
            .and_then(|layer| layer.as_ref())
            .map(|(k, _)| k.dim(2).unwrap_or(0))
            .unwrap_or(0)
    }
}

/// Video features added to the hidden state of the video tokens after the first layers.
pub struct Deepstack<'a> {
    pub positions: &'a Tensor,
    pub embeds: &'a [Tensor],
}

struct TextMlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    act: Activation,
}

impl TextMlp {
    fn new(config: &TextConfig, vb: VarBuilder) -> Result<Self> {
        let (hidden, inter) = (config.hidden_size, config.intermediate_size);
        Ok(Self {
            gate_proj: linear_no_bias(hidden, inter, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden, inter, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(inter, hidden, vb.pp("down_proj"))?,
            act: config.hidden_act,
        })
    }
}

impl Module for TextMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = self.act.forward(&self.gate_proj.forward(xs)?)?;
        self.down_proj.forward(&(gate * self.up_proj.forward(xs)?)?)
    }
}

struct TextAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl TextAttention {
    fn new(config: &TextConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim;
        let bias = config.attention_bias;
        Ok(Self {
            q_proj: linear_b(hidden, config.num_attention_heads * head_dim, bias, vb.pp("q_proj"))?,
            k_proj: linear_b(hidden, config.num_key_value_heads * head_dim, bias, vb.pp("k_proj"))?,
            v_proj: linear_b(hidden, config.num_key_value_heads * head_dim, bias, vb.pp("v_proj"))?,
            o_proj: linear_b(config.num_attention_heads * head_dim, hidden, bias, vb.pp("o_proj"))?,
            q_norm: rms_norm(head_dim, config.rms_norm_eps, vb.pp("q_norm"))?,
            k_norm: rms_norm(head_dim, config.rms_norm_eps, vb.pp("k_norm"))?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: Option<&Tensor>,
        cache: &mut Option<(Tensor, Tensor)>,
    ) -> Result<Tensor> {
        let (b_sz, seq_len, _) = xs.dims3()?;
        let dtype = xs.dtype();

        let q = self
            .q_proj
            .forward(xs)?
            .reshape((b_sz, seq_len, self.num_heads, self.head_dim))?;
        let q = self.q_norm.forward(&q)?.transpose(1, 2)?.contiguous()?;
        let k = self
            .k_proj
            .forward(xs)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?;
        let k = self.k_norm.forward(&k)?.transpose(1, 2)?.contiguous()?;
        let v = self
            .v_proj
            .forward(xs)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = rope(&q, cos, sin)?;
        let k = rope(&k, cos, sin)?;

        let (k, v) = match cache.take() {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[&prev_k, &k], 2)?,
                Tensor::cat(&[&prev_v, &v], 2)?,
            ),
            None => (k, v),
        };
        *cache = Some((k.clone(), v.clone()));

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let att = (q.matmul(&k.t()?)? * scale)?;
        let att = match mask {
            Some(mask) => att.broadcast_add(mask)?,
            None => att,
        };
        let att = candle_nn::ops::softmax_last_dim(&att.to_dtype(DType::F32)?)?.to_dtype(dtype)?;
        let ys = att
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&ys)
    }
}

struct DecoderLayer {
    self_attn: TextAttention,
    mlp: TextMlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn new(config: &TextConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: TextAttention::new(config, vb.pp("self_attn"))?,
            mlp: TextMlp::new(config, vb.pp("mlp"))?,
            input_layernorm: rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: Option<&Tensor>,
        cache: &mut Option<(Tensor, Tensor)>,
    ) -> Result<Tensor> {
        let residual = xs;
        let xs = self.input_layernorm.forward(xs)?;
        let xs = (self.self_attn.forward(&xs, cos, sin, mask, cache)? + residual)?;
        let residual = &xs;
        let ys = self
            .mlp
            .forward(&self.post_attention_layernorm.forward(&xs)?)?;
        ys + residual
    }
}

pub struct TextModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    rope_inv_freq: Vec<f32>,
    mrope_section: [usize; 3],
    device: Device,
    dtype: DType,
}

impl TextModel {
    pub fn new(config: &TextConfig, vb: VarBuilder) -> Result<Self> {
        let layers = (0..config.num_hidden_layers)
            .map(|i| DecoderLayer::new(config, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embed_tokens: candle_nn::embedding(
                config.vocab_size,
                config.hidden_size,
                vb.pp("embed_tokens"),
            )?,
            layers,
            norm: rms_norm(config.hidden_size, config.rms_norm_eps, vb.pp("norm"))?,
            rope_inv_freq: inv_freq(config.head_dim, config.rope_theta),
            mrope_section: config.rope_scaling.mrope_section,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn embed_tokens(&self) -> &Embedding {
        &self.embed_tokens
    }

    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.embed_tokens.forward(input_ids)
    }

    fn causal_mask(&self, seq_len: usize, past_len: usize) -> Result<Tensor> {
        let total = seq_len + past_len;
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| {
                (0..total).map(move |j| {
                    if j > i + past_len {
                        f32::NEG_INFINITY
                    } else {
                        0.0
                    }
                })
            })
            .collect();
        Tensor::from_vec(mask, (seq_len, total), &self.device)?.to_dtype(self.dtype)
    }

    /// Runs the decoder over `embeds` (1, seq, hidden) at the given positions and returns the
    /// normalised hidden states.
    pub fn forward(
        &self,
        embeds: &Tensor,
        positions: &[MropePosition],
        cache: &mut KvCache,
        deepstack: Option<&Deepstack<'_>>,
    ) -> Result<Tensor> {
        let (_, seq_len, _) = embeds.dims3()?;
        let half = self.rope_inv_freq.len();
        let (cos, sin) = mrope_cos_sin(positions, &self.rope_inv_freq, &self.mrope_section);
        let cos = Tensor::from_vec(cos, (seq_len, half), &self.device)?.to_dtype(self.dtype)?;
        let sin = Tensor::from_vec(sin, (seq_len, half), &self.device)?.to_dtype(self.dtype)?;

        let mask = if seq_len > 1 {
            Some(self.causal_mask(seq_len, cache.seq_len())?)
        } else {
            None
        };

        let mut xs = embeds.clone();
        for (index, (layer, layer_cache)) in self
            .layers
            .iter()
            .zip(cache.layers.iter_mut())
            .enumerate()
        {
            xs = layer.forward(&xs, &cos, &sin, mask.as_ref(), layer_cache)?;
            if let Some(deepstack) = deepstack {
                if let Some(features) = deepstack.embeds.get(index) {
                    xs = xs
                        .squeeze(0)?
                        .index_add(deepstack.positions, features, 0)?
                        .unsqueeze(0)?;
                }
            }
        }
        self.norm.forward(&xs)
    }

    /// Hidden state of the last position, shape (1, hidden).
    pub fn last_hidden(hidden: &Tensor) -> Result<Tensor> {
        let seq_len = hidden.dim(D::Minus2)?;
        hidden.narrow(D::Minus2, seq_len - 1, 1)?.squeeze(D::Minus2)
    }
}
