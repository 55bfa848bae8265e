//! RefinedWebModel (Falcon) decoders.
//!
//! Falcon checkpoints store queries, keys and values in one fused
//! `query_key_value` projection. Its output layout depends on the head
//! configuration:
//!
//! ```text
//! multi-query:  [q_0 .. q_{n-1} | k | v]
//! otherwise:    [q_0 k_0 v_0 | q_1 k_1 v_1 | ...]
//! ```
//!
//! Conversion splits it into separate query, key and value projections.

use std::collections::HashMap;
use std::ops::Deref;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::Deserialize;
use tracing::debug;

use super::{FromHf, ParamConverter};
use crate::config::{
    Activation, AttentionConfig, EmbeddingsConfig, FeedForwardConfig, LayerConfig, LayerVariant,
    NormKind, QkvMode, RotaryEmbeddingConfig, TransformerConfig,
};
use crate::error::{Error, Result};
use crate::model::TransformerDecoder;

/// RefinedWebModel configuration from HuggingFace config.json.
///
/// Accepts both the original field names and the later `falcon` names.
#[derive(Debug, Clone, Deserialize)]
pub struct HfRefinedWebModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    #[serde(alias = "num_attention_heads")]
    pub n_head: usize,
    #[serde(default, alias = "num_kv_heads")]
    pub n_head_kv: Option<usize>,
    #[serde(default)]
    pub multi_query: bool,
    #[serde(alias = "num_hidden_layers")]
    pub n_layer: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    /// Whether linear layers have biases.
    #[serde(default)]
    pub bias: bool,
    #[serde(default = "default_parallel_attn")]
    pub parallel_attn: bool,
    #[serde(default)]
    pub alibi: bool,
    #[serde(default)]
    pub new_decoder_architecture: bool,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

fn default_parallel_attn() -> bool {
    true
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_max_position_embeddings() -> usize {
    2048
}

impl HfRefinedWebModelConfig {
    fn n_key_value_heads(&self) -> Result<usize> {
        let n_kv = match self.n_head_kv {
            Some(n_kv) => n_kv,
            None if self.multi_query => 1,
            None => self.n_head,
        };
        if n_kv != 1 && n_kv != self.n_head {
            return Err(Error::config(format!(
                "{n_kv} key/value heads for {} query heads requires the new decoder architecture",
                self.n_head
            )));
        }
        Ok(n_kv)
    }
}

/// Falcon decoder: layer norm, rotary embeddings, multi-query or
/// multi-head attention, and by default parallel attention.
#[derive(Debug, Clone)]
pub struct RefinedWebModelDecoder {
    decoder: TransformerDecoder,
}

impl RefinedWebModelDecoder {
    pub fn into_inner(self) -> TransformerDecoder {
        self.decoder
    }
}

impl Deref for RefinedWebModelDecoder {
    type Target = TransformerDecoder;

    fn deref(&self) -> &TransformerDecoder {
        &self.decoder
    }
}

impl FromHf for RefinedWebModelDecoder {
    type HfConfig = HfRefinedWebModelConfig;

    fn convert_hf_config(hf: &HfRefinedWebModelConfig) -> Result<TransformerConfig> {
        if hf.alibi {
            return Err(Error::config("ALiBi position biases are not supported"));
        }
        if hf.new_decoder_architecture {
            return Err(Error::config(
                "the new Falcon decoder architecture is not supported",
            ));
        }

        let config = TransformerConfig {
            embedding: EmbeddingsConfig {
                n_pieces: hf.vocab_size,
                embedding_width: hf.hidden_size,
                projection: false,
                n_types: None,
                positions: None,
                layer_norm_eps: None,
                dropout_prob: 0.0,
            },
            layer: LayerConfig {
                hidden_width: hf.hidden_size,
                n_hidden_layers: hf.n_layer,
                attention: AttentionConfig {
                    n_query_heads: hf.n_head,
                    n_key_value_heads: hf.n_key_value_heads()?,
                    qkv_mode: QkvMode::Separate,
                    dropout_prob: 0.0,
                    use_bias: hf.bias,
                    rotary_embeddings: Some(RotaryEmbeddingConfig {
                        rotary_fraction: 1.0,
                        rotary_base: hf.rope_theta,
                        max_positions: hf.max_position_embeddings,
                    }),
                },
                feedforward: FeedForwardConfig {
                    intermediate_width: 4 * hf.hidden_size,
                    activation: Activation::Gelu,
                    use_bias: hf.bias,
                    use_gate: false,
                },
                norm: NormKind::LayerNorm,
                layer_norm_eps: hf.layer_norm_epsilon,
                dropout_prob: 0.0,
                variant: if hf.parallel_attn {
                    LayerVariant::ParallelAttention
                } else {
                    LayerVariant::Sequential
                },
            },
            padding_id: None,
        };
        config.validate()?;
        debug!(
            n_layers = hf.n_layer,
            n_kv_heads = config.layer.attention.n_key_value_heads,
            parallel_attn = hf.parallel_attn,
            "converted RefinedWebModel config"
        );
        Ok(config)
    }

    fn convert_hf_state_dict(
        params: HashMap<String, Tensor>,
        config: &TransformerConfig,
    ) -> Result<HashMap<String, Tensor>> {
        let layer = &config.layer;
        let hidden = layer.hidden_width;
        let intermediate = layer.feedforward.intermediate_width;
        let bias = layer.attention.use_bias;

        let mut params = ParamConverter::new(params);
        params.rename(
            "word_embeddings.weight",
            "embeddings.piece_embeddings.weight",
            &[config.embedding.n_pieces, hidden],
        )?;

        for i in 0..layer.n_hidden_layers {
            let hf = format!("h.{i}");
            let ours = format!("layers.{i}");

            params.rename_layer_norm(
                &format!("{hf}.input_layernorm"),
                &format!("{ours}.attn_input_layer_norm"),
                hidden,
            )?;
            if !layer.use_parallel_attention() {
                params.rename_layer_norm(
                    &format!("{hf}.post_attention_layernorm"),
                    &format!("{ours}.ffn_input_layer_norm"),
                    hidden,
                )?;
            }

            split_qkv(&mut params, &format!("{hf}.self_attention.query_key_value"), &ours, config)?;
            params.rename_linear(
                &format!("{hf}.self_attention.dense"),
                &format!("{ours}.mha.output"),
                hidden,
                hidden,
                bias,
            )?;

            params.rename_linear(
                &format!("{hf}.mlp.dense_h_to_4h"),
                &format!("{ours}.ffn.intermediate"),
                hidden,
                intermediate,
                bias,
            )?;
            params.rename_linear(
                &format!("{hf}.mlp.dense_4h_to_h"),
                &format!("{ours}.ffn.output"),
                intermediate,
                hidden,
                bias,
            )?;
        }

        params.rename_layer_norm("ln_f", "output_layer_norm", hidden)?;
        params.finish()
    }

    fn from_config(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            decoder: TransformerDecoder::new(config, vb)?,
        })
    }
}

/// Splits the fused projection `{from}.{weight,bias}` into
/// `{to}.mha.{query,key,value}`.
fn split_qkv(
    params: &mut ParamConverter,
    from: &str,
    to: &str,
    config: &TransformerConfig,
) -> Result<()> {
    let hidden = config.layer.hidden_width;
    let head_width = config.layer.head_width();
    let n_q = config.layer.attention.n_query_heads;
    let n_kv = config.layer.attention.n_key_value_heads;
    let fused_width = (n_q + 2 * n_kv) * head_width;

    let mut parts = vec![("weight", params.take(&format!("{from}.weight"), &[fused_width, hidden])?)];
    if config.layer.attention.use_bias {
        parts.push(("bias", params.take(&format!("{from}.bias"), &[fused_width])?));
    }

    for (name, fused) in parts {
        // Weights are [out, in]; biases are [out].
        let trailing = &fused.dims()[1..];
        let [query, key, value] = if n_kv == 1 {
            [
                fused.narrow(0, 0, n_q * head_width)?,
                fused.narrow(0, n_q * head_width, head_width)?,
                fused.narrow(0, (n_q + 1) * head_width, head_width)?,
            ]
        } else {
            let mut per_head = vec![n_q, 3, head_width];
            per_head.extend_from_slice(trailing);
            let fused = fused.reshape(per_head)?;
            let mut merged = vec![n_q * head_width];
            merged.extend_from_slice(trailing);
            [
                fused.narrow(1, 0, 1)?.reshape(merged.as_slice())?,
                fused.narrow(1, 1, 1)?.reshape(merged.as_slice())?,
                fused.narrow(1, 2, 1)?.reshape(merged.as_slice())?,
            ]
        };
        params.insert(format!("{to}.mha.query.{name}"), query.contiguous()?);
        params.insert(format!("{to}.mha.key.{name}"), key.contiguous()?);
        params.insert(format!("{to}.mha.value.{name}"), value.contiguous()?);
    }
    Ok(())
}
