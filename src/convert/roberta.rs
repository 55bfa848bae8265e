//! RoBERTa encoders.

use std::collections::HashMap;
use std::ops::Deref;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::Deserialize;
use tracing::debug;

use super::{FromHf, ParamConverter};
use crate::config::{
    Activation, AttentionConfig, EmbeddingsConfig, FeedForwardConfig, LayerConfig, LayerVariant,
    NormKind, PositionEmbeddingsConfig, PositionScheme, QkvMode, TransformerConfig,
};
use crate::error::Result;
use crate::model::TransformerEncoder;

/// RoBERTa configuration from HuggingFace config.json.
#[derive(Debug, Clone, Deserialize)]
pub struct HfRobertaConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_dropout_prob")]
    pub hidden_dropout_prob: f32,
    #[serde(default = "default_dropout_prob")]
    pub attention_probs_dropout_prob: f32,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: u32,
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

fn default_dropout_prob() -> f32 {
    0.1
}

fn default_max_position_embeddings() -> usize {
    514
}

fn default_type_vocab_size() -> usize {
    1
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

fn default_pad_token_id() -> u32 {
    1
}

/// RoBERTa encoder: post-norm layers with learned positions that start
/// after the padding id.
#[derive(Debug, Clone)]
pub struct RobertaEncoder {
    encoder: TransformerEncoder,
}

impl RobertaEncoder {
    pub fn into_inner(self) -> TransformerEncoder {
        self.encoder
    }
}

impl Deref for RobertaEncoder {
    type Target = TransformerEncoder;

    fn deref(&self) -> &TransformerEncoder {
        &self.encoder
    }
}

impl FromHf for RobertaEncoder {
    type HfConfig = HfRobertaConfig;

    fn convert_hf_config(hf: &HfRobertaConfig) -> Result<TransformerConfig> {
        let config = TransformerConfig {
            embedding: EmbeddingsConfig {
                n_pieces: hf.vocab_size,
                embedding_width: hf.hidden_size,
                projection: false,
                n_types: Some(hf.type_vocab_size),
                positions: Some(PositionEmbeddingsConfig {
                    n_positions: hf.max_position_embeddings,
                    scheme: PositionScheme::AfterPadding {
                        padding_id: hf.pad_token_id,
                    },
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
                variant: LayerVariant::Sequential,
            },
            padding_id: Some(hf.pad_token_id),
        };
        config.validate()?;
        debug!(n_layers = hf.num_hidden_layers, "converted RoBERTa config");
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
        for i in 0..layer.n_hidden_layers {
            let hf = format!("encoder.layer.{i}");
            let ours = format!("layers.{i}");
            for name in ["query", "key", "value"] {
                params.rename_linear(
                    &format!("{hf}.attention.self.{name}"),
                    &format!("{ours}.mha.{name}"),
                    hidden,
                    hidden,
                    true,
                )?;
            }
            params.rename_linear(
                &format!("{hf}.attention.output.dense"),
                &format!("{ours}.mha.output"),
                hidden,
                hidden,
                true,
            )?;
            params.rename_layer_norm(
                &format!("{hf}.attention.output.LayerNorm"),
                &format!("{ours}.attn_residual_layer_norm"),
                hidden,
            )?;
            params.rename_linear(
                &format!("{hf}.intermediate.dense"),
                &format!("{ours}.ffn.intermediate"),
                hidden,
                intermediate,
                true,
            )?;
            params.rename_linear(
                &format!("{hf}.output.dense"),
                &format!("{ours}.ffn.output"),
                intermediate,
                hidden,
                true,
            )?;
            params.rename_layer_norm(
                &format!("{hf}.output.LayerNorm"),
                &format!("{ours}.ffn_residual_layer_norm"),
                hidden,
            )?;
        }

        params.finish()
    }

    fn from_config(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            encoder: TransformerEncoder::new(config, vb)?,
        })
    }
}

/// Converts the word, position and token type embeddings and the embedding
/// layer norm shared by the BERT family.
pub(crate) fn convert_bert_embeddings(
    params: &mut ParamConverter,
    config: &TransformerConfig,
) -> Result<()> {
    let embedding = &config.embedding;
    let width = embedding.embedding_width;
    params.rename(
        "embeddings.word_embeddings.weight",
        "embeddings.piece_embeddings.weight",
        &[embedding.n_pieces, width],
    )?;
    if let Some(positions) = &embedding.positions {
        params.rename(
            "embeddings.position_embeddings.weight",
            "embeddings.position_embeddings.weight",
            &[positions.n_positions, width],
        )?;
    }
    if let Some(n_types) = embedding.n_types {
        params.rename(
            "embeddings.token_type_embeddings.weight",
            "embeddings.type_embeddings.weight",
            &[n_types, width],
        )?;
    }
    if embedding.layer_norm_eps.is_some() {
        params.rename_layer_norm("embeddings.LayerNorm", "embeddings.layer_norm", width)?;
    }
    Ok(())
}
