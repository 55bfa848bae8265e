//! Transformer layers.
//!
//! A layer combines self-attention and a feed-forward block with residual
//! connections and normalization. Decoder layers normalize before each
//! sub-layer (pre-norm); encoder layers follow the BERT layout and normalize
//! after each residual addition (post-norm).

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::attention::{rotary_embeds, AttentionOutput, SelfAttention};
use super::mlp::PointwiseFeedForward;
use super::norm::Norm;
use super::rope::QueryKeyRotaryEmbeddings;
use crate::config::LayerConfig;
use crate::core::{AttentionMask, KeyValueCache};
use crate::error::{Error, Result};

fn dropout(x: Tensor, p: f32, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        Ok(candle_nn::ops::dropout(&x, p)?)
    } else {
        Ok(x)
    }
}

/// Pre-norm decoder layer.
///
/// Sequential mode:
///
/// ```text
/// Input ──┬─► attn_input_layer_norm ─► self-attention ─► + ──┬─► ffn_input_layer_norm ─► ffn ─► + ─► Output
///         └──────────────────────────────────────────────────┘  └──────────────────────────────────┘
/// ```
///
/// Parallel attention mode (RefinedWebModel):
///
/// ```text
/// Input ──┬─► attn_input_layer_norm ──┬─► self-attention ──► +
///         │                           └─► ffn ─────────────► +
///         └────────────────────────────────────────────────► + ─► Output
/// ```
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    attn_input_layer_norm: Norm,
    mha: SelfAttention,
    /// Absent in parallel attention mode.
    ffn_input_layer_norm: Option<Norm>,
    ffn: PointwiseFeedForward,
    use_parallel_attention: bool,
    dropout_prob: f32,
}

impl DecoderLayer {
    /// Loads a decoder layer from `vb`.
    ///
    /// Fails when the attention configuration lacks rotary embeddings, since
    /// decoders have no other source of position information.
    pub fn new(config: &LayerConfig, vb: VarBuilder) -> Result<Self> {
        let rotary = rotary_embeds(&config.attention, config.hidden_width, vb.device())?;
        Self::with_rotary_embeds(config, rotary, vb)
    }

    /// Like [`DecoderLayer::new`], with rotary embeddings shared with other
    /// layers.
    pub fn with_rotary_embeds(
        config: &LayerConfig,
        rotary_embeds: Option<QueryKeyRotaryEmbeddings>,
        vb: VarBuilder,
    ) -> Result<Self> {
        if rotary_embeds.is_none() {
            return Err(Error::config(
                "decoder attention config does not contain rotary embedding parameters",
            ));
        }
        let width = config.hidden_width;
        let eps = config.layer_norm_eps;
        let use_parallel_attention = config.use_parallel_attention();

        let attn_input_layer_norm = Norm::new(config.norm, width, eps, vb.pp("attn_input_layer_norm"))?;
        let mha = SelfAttention::with_rotary_embeds(
            &config.attention,
            width,
            true,
            rotary_embeds,
            vb.pp("mha"),
        )?;
        let ffn_input_layer_norm = if use_parallel_attention {
            None
        } else {
            Some(Norm::new(config.norm, width, eps, vb.pp("ffn_input_layer_norm"))?)
        };
        let ffn = PointwiseFeedForward::new(&config.feedforward, width, vb.pp("ffn"))?;

        Ok(Self {
            attn_input_layer_norm,
            mha,
            ffn_input_layer_norm,
            ffn,
            use_parallel_attention,
            dropout_prob: config.dropout_prob,
        })
    }

    /// Returns a reference to the attention module.
    pub fn self_attn(&self) -> &SelfAttention {
        &self.mha
    }

    /// Returns a reference to the feed-forward module.
    pub fn ffn(&self) -> &PointwiseFeedForward {
        &self.ffn
    }

    /// Returns true if attention and feed-forward run in parallel.
    pub fn use_parallel_attention(&self) -> bool {
        self.use_parallel_attention
    }

    /// Forward pass through the decoder layer.
    ///
    /// The cache produced by the attention sub-layer is passed through
    /// unchanged.
    pub fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: &AttentionMask,
        cache: Option<&KeyValueCache>,
        store_cache: bool,
        train: bool,
    ) -> Result<AttentionOutput> {
        let normed = self.attn_input_layer_norm.forward(input)?;
        let attn = self
            .mha
            .forward_t(&normed, attention_mask, cache, store_cache, train)?;
        let attn_out = dropout(attn.hidden_states, self.dropout_prob, train)?;

        let hidden_states = match &self.ffn_input_layer_norm {
            Some(ffn_input_layer_norm) => {
                let residual = (input + attn_out)?;
                let ffn_out = self.ffn.forward(&ffn_input_layer_norm.forward(&residual)?)?;
                (residual + dropout(ffn_out, self.dropout_prob, train)?)?
            }
            None => {
                let ffn_out = dropout(self.ffn.forward(&normed)?, self.dropout_prob, train)?;
                ((input + attn_out)? + ffn_out)?
            }
        };

        Ok(AttentionOutput {
            hidden_states,
            cache: attn.cache,
        })
    }
}

/// Post-norm encoder layer (BERT layout).
///
/// ```text
/// h = attn_residual_layer_norm(x + self_attention(x))
/// y = ffn_residual_layer_norm(h + ffn(h))
/// ```
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    mha: SelfAttention,
    attn_residual_layer_norm: Norm,
    ffn: PointwiseFeedForward,
    ffn_residual_layer_norm: Norm,
    dropout_prob: f32,
}

impl EncoderLayer {
    pub fn new(config: &LayerConfig, vb: VarBuilder) -> Result<Self> {
        let rotary = rotary_embeds(&config.attention, config.hidden_width, vb.device())?;
        Self::with_rotary_embeds(config, rotary, vb)
    }

    pub fn with_rotary_embeds(
        config: &LayerConfig,
        rotary_embeds: Option<QueryKeyRotaryEmbeddings>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let width = config.hidden_width;
        let eps = config.layer_norm_eps;
        Ok(Self {
            mha: SelfAttention::with_rotary_embeds(
                &config.attention,
                width,
                false,
                rotary_embeds,
                vb.pp("mha"),
            )?,
            attn_residual_layer_norm: Norm::new(
                config.norm,
                width,
                eps,
                vb.pp("attn_residual_layer_norm"),
            )?,
            ffn: PointwiseFeedForward::new(&config.feedforward, width, vb.pp("ffn"))?,
            ffn_residual_layer_norm: Norm::new(
                config.norm,
                width,
                eps,
                vb.pp("ffn_residual_layer_norm"),
            )?,
            dropout_prob: config.dropout_prob,
        })
    }

    /// Returns a reference to the attention module.
    pub fn self_attn(&self) -> &SelfAttention {
        &self.mha
    }

    pub fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: &AttentionMask,
        train: bool,
    ) -> Result<Tensor> {
        let attn = self.mha.forward_t(input, attention_mask, None, false, train)?;
        let attn_out = dropout(attn.hidden_states, self.dropout_prob, train)?;
        let hidden = self.attn_residual_layer_norm.forward(&(input + attn_out)?)?;

        let ffn_out = dropout(self.ffn.forward(&hidden)?, self.dropout_prob, train)?;
        self.ffn_residual_layer_norm.forward(&(hidden + ffn_out)?)
    }
}

/// A group of encoder layers whose parameters are shared by several layer
/// positions (ALBERT). Non-grouped encoders use one single-layer group per
/// position.
#[derive(Debug, Clone)]
pub struct LayerGroup {
    layers: Vec<EncoderLayer>,
}

impl LayerGroup {
    /// Loads `n_layers` layers from `vb.pp("group_layers.{i}")`.
    pub fn new(
        config: &LayerConfig,
        n_layers: usize,
        rotary_embeds: Option<&QueryKeyRotaryEmbeddings>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let layers = (0..n_layers)
            .map(|i| {
                EncoderLayer::with_rotary_embeds(
                    config,
                    rotary_embeds.cloned(),
                    vb.pp(format!("group_layers.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Wraps a single layer.
    pub fn single(layer: EncoderLayer) -> Self {
        Self {
            layers: vec![layer],
        }
    }

    pub fn layers(&self) -> &[EncoderLayer] {
        &self.layers
    }

    /// Applies every layer of the group in order.
    pub fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: &AttentionMask,
        train: bool,
    ) -> Result<Tensor> {
        let mut hidden = input.clone();
        for layer in &self.layers {
            hidden = layer.forward_t(&hidden, attention_mask, train)?;
        }
        Ok(hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Activation, AttentionConfig, FeedForwardConfig, LayerVariant, NormKind, QkvMode,
        RotaryEmbeddingConfig,
    };
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn layer_config(variant: LayerVariant, rotary: bool) -> LayerConfig {
        LayerConfig {
            hidden_width: 32,
            n_hidden_layers: 2,
            attention: AttentionConfig {
                n_query_heads: 4,
                n_key_value_heads: 2,
                qkv_mode: QkvMode::Separate,
                dropout_prob: 0.0,
                use_bias: false,
                rotary_embeddings: rotary.then(|| RotaryEmbeddingConfig {
                    rotary_fraction: 1.0,
                    rotary_base: 10000.0,
                    max_positions: 64,
                }),
            },
            feedforward: FeedForwardConfig {
                intermediate_width: 64,
                activation: Activation::Gelu,
                use_bias: true,
                use_gate: false,
            },
            norm: NormKind::LayerNorm,
            layer_norm_eps: 1e-5,
            dropout_prob: 0.0,
            variant,
        }
    }

    #[test]
    fn test_decoder_layer_requires_rotary() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let result = DecoderLayer::new(&layer_config(LayerVariant::Sequential, false), vb);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_parallel_layer_has_single_norm() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer =
            DecoderLayer::new(&layer_config(LayerVariant::ParallelAttention, true), vb).unwrap();
        assert!(layer.use_parallel_attention());

        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.iter().any(|n| n.starts_with("attn_input_layer_norm")));
        assert!(!names.iter().any(|n| n.starts_with("ffn_input_layer_norm")));
    }

    #[test]
    fn test_decoder_layer_cache_pass_through() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = DecoderLayer::new(&layer_config(LayerVariant::Sequential, true), vb).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (1, 4, 32), &device).unwrap();
        let mask = AttentionMask::all_valid(1, 4, &device).unwrap();
        let out = layer.forward_t(&x, &mask, None, true, false).unwrap();
        assert_eq!(out.hidden_states.dims(), &[1, 4, 32]);
        let cache = out.cache.unwrap();
        assert_eq!(cache.len(), 4);

        let x_next = Tensor::randn(0.0f32, 1.0, (1, 1, 32), &device).unwrap();
        let mask = AttentionMask::all_valid(1, 5, &device).unwrap();
        let out = layer.forward_t(&x_next, &mask, Some(&cache), true, false).unwrap();
        assert_eq!(out.hidden_states.dims(), &[1, 1, 32]);
        assert_eq!(out.cache.unwrap().len(), 5);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_encoder_layer_forward() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = EncoderLayer::new(&layer_config(LayerVariant::Sequential, false), vb).unwrap();
        assert!(!layer.self_attn().is_causal());

        let x = Tensor::randn(0.0f32, 1.0, (2, 3, 32), &device).unwrap();
        let mask = AttentionMask::all_valid(2, 3, &device).unwrap();
        let out = layer.forward_t(&x, &mask, false).unwrap();
        assert_eq!(out.dims(), &[2, 3, 32]);
    }
}
