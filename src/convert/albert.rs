//! ALBERT encoders.
//!
//! ALBERT factorizes the embedding matrix (pieces are embedded with a small
//! width and projected to the hidden width) and shares layer parameters:
//! `num_hidden_layers` layer positions are served by `num_hidden_groups`
//! groups of `inner_group_num` layers each.

use std::collections::HashMap;
use std::ops::Deref;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::Deserialize;
use tracing::debug;

use super::roberta::convert_bert_embeddings;
use super::{FromHf, ParamConverter};
use crate::config::{
    Activation, AttentionConfig, EmbeddingsConfig, FeedForwardConfig, LayerConfig, LayerVariant,
    NormKind, PositionEmbeddingsConfig, PositionScheme, QkvMode, TransformerConfig,
};
use crate::error::{Error, Result};
use crate::model::TransformerEncoder;

/// ALBERT configuration from HuggingFace config.json.
#[derive(Debug, Clone, Deserialize)]
pub struct HfAlbertConfig {
    pub vocab_size: usize,
    #[serde(default = "default_embedding_size")]
    pub embedding_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    #[serde(default = "default_one")]
    pub num_hidden_groups: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_one")]
    pub inner_group_num: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default)]
    pub hidden_dropout_prob: f32,
    #[serde(default)]
    pub attention_probs_dropout_prob: f32,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub pad_token_id: u32,
}

fn default_embedding_size() -> usize {
    128
}

fn default_one() -> usize {
    1
}

fn default_hidden_act() -> String {
    "gelu_new".to_string()
}

fn default_max_position_embeddings() -> usize {
    512
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

/// ALBERT encoder with shared layer groups.
#[derive(Debug, Clone)]
pub struct AlbertEncoder {
    encoder: TransformerEncoder,
}

impl AlbertEncoder {
    pub fn into_inner(self) -> TransformerEncoder {
        self.encoder
    }
}

impl Deref for AlbertEncoder {
    type Target = TransformerEncoder;

    fn deref(&self) -> &TransformerEncoder {
        &self.encoder
    }
}

impl FromHf for AlbertEncoder {
    type HfConfig = HfAlbertConfig;

    fn convert_hf_config(hf: &HfAlbertConfig) -> Result<TransformerConfig> {
        let config = TransformerConfig {
            embedding: EmbeddingsConfig {
                n_pieces: hf.vocab_size,
                embedding_width: hf.embedding_size,
                projection: true,
                n_types: Some(hf.type_vocab_size),
                positions: Some(PositionEmbeddingsConfig {
                    n_positions: hf.max_position_embeddings,
                    scheme: PositionScheme::Absolute,
                }),
                layer_norm_eps: Some(hf.layer_norm_eps),
                dropout_prob: hf.hidden_dropout_prob,
            },
            layer: LayerConfig {
                hidden_width: hf.hidden_size,
                n_hidden_layers: hf.num_hidden_layers,
                attention: AttentionConfig {
                    n_query_heads: hf.num_attention_heads,
                    n_key_value_heads: hf.num_attention_heads,
                    qkv_mode: QkvMode::Separate,
                    dropout_prob: hf.attention_probs_dropout_prob,
                    use_bias: true,
                    rotary_embeddings: None,
                },
                feedforward: FeedForwardConfig {
                    intermediate_width: hf.intermediate_size,
                    activation: Activation::from_hf_name(&hf.hidden_act)?,
                    use_bias: true,
                    use_gate: false,
                },
                norm: NormKind::LayerNorm,
                layer_norm_eps: hf.layer_norm_eps,
                dropout_prob: hf.hidden_dropout_prob,
                variant: LayerVariant::Grouped {
                    n_hidden_groups: hf.num_hidden_groups,
                    inner_group_size: hf.inner_group_num,
                },
            },
            padding_id: Some(hf.pad_token_id),
        };
        config.validate()?;
        debug!(
            n_layers = hf.num_hidden_layers,
            n_groups = hf.num_hidden_groups,
            inner_group_size = hf.inner_group_num,
            "converted ALBERT config"
        );
        Ok(config)
    }

    fn convert_hf_state_dict(
        params: HashMap<String, Tensor>,
        config: &TransformerConfig,
    ) -> Result<HashMap<String, Tensor>> {
        let mut params = ParamConverter::new(params);
        convert_bert_embeddings(&mut params, config)?;

        let layer = &config.layer;
        let hidden = layer.hidden_width;
        let intermediate = layer.feedforward.intermediate_width;
        params.rename_linear(
            "encoder.embedding_hidden_mapping_in",
            "embeddings.projection",
            config.embedding.embedding_width,
            hidden,
            true,
        )?;

        let LayerVariant::Grouped {
            n_hidden_groups,
            inner_group_size,
        } = layer.variant
        else {
            return Err(Error::config("ALBERT checkpoints require grouped layers"));
        };

        for g in 0..n_hidden_groups {
            for j in 0..inner_group_size {
                let hf = format!("encoder.albert_layer_groups.{g}.albert_layers.{j}");
                let ours = format!("groups.{g}.group_layers.{j}");
                for (from, to) in [
                    ("query", "query"),
                    ("key", "key"),
                    ("value", "value"),
                    ("dense", "output"),
                ] {
                    params.rename_linear(
                        &format!("{hf}.attention.{from}"),
                        &format!("{ours}.mha.{to}"),
                        hidden,
                        hidden,
                        true,
                    )?;
                }
                params.rename_layer_norm(
                    &format!("{hf}.attention.LayerNorm"),
                    &format!("{ours}.attn_residual_layer_norm"),
                    hidden,
                )?;
                params.rename_linear(
                    &format!("{hf}.ffn"),
                    &format!("{ours}.ffn.intermediate"),
                    hidden,
                    intermediate,
                    true,
                )?;
                params.rename_linear(
                    &format!("{hf}.ffn_output"),
                    &format!("{ours}.ffn.output"),
                    intermediate,
                    hidden,
                    true,
                )?;
                params.rename_layer_norm(
                    &format!("{hf}.full_layer_layer_norm"),
                    &format!("{ours}.ffn_residual_layer_norm"),
                    hidden,
                )?;
            }
        }

        params.finish()
    }

    fn from_config(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            encoder: TransformerEncoder::new(config, vb)?,
        })
    }
}
