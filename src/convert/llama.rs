//! Llama decoders.

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
use crate::error::Result;
use crate::model::TransformerDecoder;

/// Llama configuration from HuggingFace config.json.
#[derive(Debug, Clone, Deserialize)]
pub struct HfLlamaConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (MLP).
    pub intermediate_size: usize,
    /// Number of transformer layers.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of key-value heads (for GQA); defaults to the number of
    /// attention heads.
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    /// RMSNorm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// RoPE theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Maximum sequence length.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_max_position_embeddings() -> usize {
    2048
}

/// Llama decoder: pre-norm RMSNorm layers, rotary embeddings, grouped-query
/// attention and a SwiGLU feed-forward block.
#[derive(Debug, Clone)]
pub struct LlamaDecoder {
    decoder: TransformerDecoder,
}

impl LlamaDecoder {
    pub fn into_inner(self) -> TransformerDecoder {
        self.decoder
    }
}

impl Deref for LlamaDecoder {
    type Target = TransformerDecoder;

    fn deref(&self) -> &TransformerDecoder {
        &self.decoder
    }
}

impl FromHf for LlamaDecoder {
    type HfConfig = HfLlamaConfig;

    fn convert_hf_config(hf: &HfLlamaConfig) -> Result<TransformerConfig> {
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
                n_hidden_layers: hf.num_hidden_layers,
                attention: AttentionConfig {
                    n_query_heads: hf.num_attention_heads,
                    n_key_value_heads: hf.num_key_value_heads.unwrap_or(hf.num_attention_heads),
                    qkv_mode: QkvMode::Separate,
                    dropout_prob: 0.0,
                    use_bias: false,
                    rotary_embeddings: Some(RotaryEmbeddingConfig {
                        rotary_fraction: 1.0,
                        rotary_base: hf.rope_theta,
                        max_positions: hf.max_position_embeddings,
                    }),
                },
                feedforward: FeedForwardConfig {
                    intermediate_width: hf.intermediate_size,
                    activation: Activation::from_hf_name(&hf.hidden_act)?,
                    use_bias: false,
                    use_gate: true,
                },
                norm: NormKind::RmsNorm,
                layer_norm_eps: hf.rms_norm_eps,
                dropout_prob: 0.0,
                variant: LayerVariant::Sequential,
            },
            padding_id: hf.pad_token_id,
        };
        config.validate()?;
        debug!(
            n_layers = hf.num_hidden_layers,
            n_kv_heads = config.layer.attention.n_key_value_heads,
            "converted Llama config"
        );
        Ok(config)
    }

    fn convert_hf_state_dict(
        params: HashMap<String, Tensor>,
        config: &TransformerConfig,
    ) -> Result<HashMap<String, Tensor>> {
        let layer = &config.layer;
        let hidden = layer.hidden_width;
        let kv_width = layer.attention.n_key_value_heads * layer.head_width();
        let intermediate = layer.feedforward.intermediate_width;

        let mut params = ParamConverter::new(params);
        params.rename(
            "embed_tokens.weight",
            "embeddings.piece_embeddings.weight",
            &[config.embedding.n_pieces, hidden],
        )?;

        for i in 0..layer.n_hidden_layers {
            let prefix = format!("layers.{i}");
            for (from, to, out_width) in [
                ("q_proj", "query", hidden),
                ("k_proj", "key", kv_width),
                ("v_proj", "value", kv_width),
                ("o_proj", "output", hidden),
            ] {
                params.rename_linear(
                    &format!("{prefix}.self_attn.{from}"),
                    &format!("{prefix}.mha.{to}"),
                    hidden,
                    out_width,
                    false,
                )?;
            }
            for (from, to) in [("gate_proj", "gate"), ("up_proj", "intermediate")] {
                params.rename_linear(
                    &format!("{prefix}.mlp.{from}"),
                    &format!("{prefix}.ffn.{to}"),
                    hidden,
                    intermediate,
                    false,
                )?;
            }
            params.rename_linear(
                &format!("{prefix}.mlp.down_proj"),
                &format!("{prefix}.ffn.output"),
                intermediate,
                hidden,
                false,
            )?;
            params.rename(
                &format!("{prefix}.input_layernorm.weight"),
                &format!("{prefix}.attn_input_layer_norm.weight"),
                &[hidden],
            )?;
            params.rename(
                &format!("{prefix}.post_attention_layernorm.weight"),
                &format!("{prefix}.ffn_input_layer_norm.weight"),
                &[hidden],
            )?;
        }

        params.rename("norm.weight", "output_layer_norm.weight", &[hidden])?;
        params.finish()
    }

    fn from_config(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            decoder: TransformerDecoder::new(config, vb)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let json = r#"{
            "vocab_size": 32000,
            "hidden_size": 4096,
            "intermediate_size": 11008,
            "num_hidden_layers": 32,
            "num_attention_heads": 32
        }"#;
        let hf: HfLlamaConfig = serde_json::from_str(json).unwrap();
        let config = LlamaDecoder::convert_hf_config(&hf).unwrap();

        assert_eq!(config.layer.attention.n_key_value_heads, 32);
        assert_eq!(config.layer.feedforward.activation, Activation::Silu);
        let rotary = config.layer.attention.rotary_embeddings.unwrap();
        assert_eq!(rotary.rotary_base, 10000.0);
        assert_eq!(rotary.max_positions, 2048);
        assert_eq!(config.padding_id, None);
    }

    #[test]
    fn test_grouped_query_config() {
        let json = r#"{
            "vocab_size": 32000,
            "hidden_size": 64,
            "intermediate_size": 128,
            "num_hidden_layers": 2,
            "num_attention_heads": 8,
            "num_key_value_heads": 3
        }"#;
        let hf: HfLlamaConfig = serde_json::from_str(json).unwrap();
        assert!(LlamaDecoder::convert_hf_config(&hf).is_err());
    }
}
