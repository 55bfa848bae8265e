//! Configuration types for curated-candle.
//!
//! A [`TransformerConfig`] fully determines the shapes of every module in a
//! model. It is produced once, either by hand or by one of the checkpoint
//! converters in [`crate::convert`], and validated before any layer is built.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Activation function used by the feed-forward block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// GELU with the exact (erf) formulation.
    Gelu,
    /// GELU with the tanh approximation.
    GeluNew,
    /// Rectified linear unit.
    Relu,
    /// Sigmoid linear unit (swish).
    Silu,
}

impl Activation {
    /// Maps an activation name as written in hub `config.json` files.
    pub fn from_hf_name(name: &str) -> Result<Self> {
        match name {
            "gelu" => Ok(Activation::Gelu),
            "gelu_new" | "gelu_fast" | "gelu_pytorch_tanh" => Ok(Activation::GeluNew),
            "relu" => Ok(Activation::Relu),
            "silu" | "swish" => Ok(Activation::Silu),
            other => Err(Error::config(format!("unsupported activation `{other}`"))),
        }
    }
}

/// Normalization applied around attention and feed-forward blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    /// Mean-centering layer norm with weight and bias.
    LayerNorm,
    /// Root mean square norm with weight only.
    RmsNorm,
}

/// Layout of the query/key/value projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QkvMode {
    /// Three independent projections.
    Separate,
    /// One fused projection whose output is split per head into `[q, k, v]`.
    /// Only valid with uniform heads.
    MergedSplitBefore,
    /// One fused projection whose output is `[q heads | k heads | v heads]`.
    MergedSplitAfter,
}

/// Rotary position embedding parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotaryEmbeddingConfig {
    /// Fraction of each head's width that is rotated, in `(0, 1]`.
    pub rotary_fraction: f64,
    /// Base of the frequency schedule.
    pub rotary_base: f64,
    /// Number of positions for which cos/sin tables are precomputed.
    #[serde(default = "default_rotary_max_positions")]
    pub max_positions: usize,
}

fn default_rotary_max_positions() -> usize {
    2048
}

impl RotaryEmbeddingConfig {
    /// Number of rotated dimensions for a head of `head_width`.
    pub fn rotary_width(&self, head_width: usize) -> Result<usize> {
        if !(self.rotary_fraction > 0.0 && self.rotary_fraction <= 1.0) {
            return Err(Error::config(format!(
                "rotary fraction must be in (0, 1], got {}",
                self.rotary_fraction
            )));
        }
        if self.rotary_base <= 0.0 {
            return Err(Error::config(format!(
                "rotary base must be positive, got {}",
                self.rotary_base
            )));
        }
        let width = (self.rotary_fraction * head_width as f64).round() as usize;
        if width == 0 || width % 2 != 0 {
            return Err(Error::config(format!(
                "rotary width {width} (fraction {} of head width {head_width}) must be even and non-zero",
                self.rotary_fraction
            )));
        }
        Ok(width)
    }
}

/// Self-attention hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Number of query heads.
    pub n_query_heads: usize,
    /// Number of key/value heads; divides `n_query_heads`.
    pub n_key_value_heads: usize,
    /// Projection layout.
    pub qkv_mode: QkvMode,
    /// Dropout applied to attention weights in training mode.
    #[serde(default)]
    pub dropout_prob: f32,
    /// Whether projections carry bias terms.
    pub use_bias: bool,
    /// Rotary embeddings, when the architecture uses them.
    #[serde(default)]
    pub rotary_embeddings: Option<RotaryEmbeddingConfig>,
}

/// Feed-forward block hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedForwardConfig {
    /// Width of the intermediate projection.
    pub intermediate_width: usize,
    /// Activation function.
    pub activation: Activation,
    /// Whether projections carry bias terms.
    pub use_bias: bool,
    /// Whether a gate projection multiplies the intermediate projection.
    pub use_gate: bool,
}

/// How layers are composed into a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerVariant {
    /// Attention then feed-forward, one parameter set per layer.
    Sequential,
    /// Attention and feed-forward read the same normalized input.
    ParallelAttention,
    /// `n_hidden_groups` parameter sets shared across the layer positions.
    /// Each group holds `inner_group_size` layers.
    Grouped {
        n_hidden_groups: usize,
        inner_group_size: usize,
    },
}

/// Hyperparameters shared by every layer of a stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Hidden width of the residual stream.
    pub hidden_width: usize,
    /// Number of logical layer positions.
    pub n_hidden_layers: usize,
    pub attention: AttentionConfig,
    pub feedforward: FeedForwardConfig,
    pub norm: NormKind,
    pub layer_norm_eps: f64,
    /// Dropout on residual branches in training mode.
    #[serde(default)]
    pub dropout_prob: f32,
    pub variant: LayerVariant,
}

impl LayerConfig {
    /// Width of a single attention head.
    pub fn head_width(&self) -> usize {
        self.hidden_width / self.attention.n_query_heads
    }

    /// Whether attention and feed-forward run in parallel.
    pub fn use_parallel_attention(&self) -> bool {
        matches!(self.variant, LayerVariant::ParallelAttention)
    }

    /// Number of distinct parameter groups in the stack.
    pub fn n_groups(&self) -> usize {
        match self.variant {
            LayerVariant::Grouped {
                n_hidden_groups, ..
            } => n_hidden_groups,
            _ => self.n_hidden_layers,
        }
    }

    /// Number of layer positions each group is applied at.
    pub fn layers_per_group(&self) -> usize {
        self.n_hidden_layers / self.n_groups().max(1)
    }

    fn validate(&self) -> Result<()> {
        let attention = &self.attention;
        if self.hidden_width == 0 || self.n_hidden_layers == 0 {
            return Err(Error::config(
                "hidden width and number of hidden layers must be non-zero",
            ));
        }
        if attention.n_query_heads == 0 || attention.n_key_value_heads == 0 {
            return Err(Error::config("attention head counts must be non-zero"));
        }
        if self.hidden_width % attention.n_query_heads != 0 {
            return Err(Error::config(format!(
                "hidden width ({}) must be divisible by the number of query heads ({})",
                self.hidden_width, attention.n_query_heads
            )));
        }
        if attention.n_query_heads % attention.n_key_value_heads != 0 {
            return Err(Error::config(format!(
                "number of query heads ({}) must be a multiple of the number of key/value heads ({})",
                attention.n_query_heads, attention.n_key_value_heads
            )));
        }
        if attention.qkv_mode == QkvMode::MergedSplitBefore
            && attention.n_query_heads != attention.n_key_value_heads
        {
            return Err(Error::config(
                "merged split-before projections require uniform attention heads",
            ));
        }
        if let Some(rotary) = &attention.rotary_embeddings {
            rotary.rotary_width(self.head_width())?;
        }
        if self.feedforward.intermediate_width == 0 {
            return Err(Error::config("intermediate width must be non-zero"));
        }
        check_dropout("attention", attention.dropout_prob)?;
        check_dropout("layer", self.dropout_prob)?;
        if let LayerVariant::Grouped {
            n_hidden_groups,
            inner_group_size,
        } = self.variant
        {
            if n_hidden_groups == 0 || inner_group_size == 0 {
                return Err(Error::config(
                    "number of hidden groups and inner group size must be non-zero",
                ));
            }
            if self.n_hidden_layers % n_hidden_groups != 0 {
                return Err(Error::config(format!(
                    "number of hidden layers ({}) must be divisible by the number of hidden groups ({})",
                    self.n_hidden_layers, n_hidden_groups
                )));
            }
        }
        Ok(())
    }
}

/// How position ids are derived for learned position embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PositionScheme {
    /// Positions `0..seq_len`.
    Absolute,
    /// RoBERTa positions: padding gets `padding_id`, other pieces count up
    /// from `padding_id + 1`.
    AfterPadding { padding_id: u32 },
}

/// Learned position embedding table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEmbeddingsConfig {
    pub n_positions: usize,
    pub scheme: PositionScheme,
}

/// Embedding layer hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    /// Vocabulary size.
    pub n_pieces: usize,
    /// Width of the piece embeddings.
    pub embedding_width: usize,
    /// Project the embeddings to the hidden width. Required when the widths
    /// differ.
    #[serde(default)]
    pub projection: bool,
    /// Size of the token type vocabulary, if any.
    #[serde(default)]
    pub n_types: Option<usize>,
    #[serde(default)]
    pub positions: Option<PositionEmbeddingsConfig>,
    /// Epsilon of the embedding layer norm; `None` disables it.
    #[serde(default)]
    pub layer_norm_eps: Option<f64>,
    #[serde(default)]
    pub dropout_prob: f32,
}

/// Complete model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub embedding: EmbeddingsConfig,
    pub layer: LayerConfig,
    /// Padding piece id used to derive attention masks.
    #[serde(default)]
    pub padding_id: Option<u32>,
}

impl TransformerConfig {
    /// Checks that the configuration describes a buildable model.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.n_pieces == 0 || self.embedding.embedding_width == 0 {
            return Err(Error::config(
                "vocabulary size and embedding width must be non-zero",
            ));
        }
        if !self.embedding.projection && self.embedding.embedding_width != self.layer.hidden_width {
            return Err(Error::config(format!(
                "embedding width {} differs from hidden width {} but no projection is configured",
                self.embedding.embedding_width, self.layer.hidden_width
            )));
        }
        check_dropout("embedding", self.embedding.dropout_prob)?;
        self.layer.validate()
    }
}

fn check_dropout(what: &str, p: f32) -> Result<()> {
    if (0.0..1.0).contains(&p) {
        Ok(())
    } else {
        Err(Error::config(format!(
            "{what} dropout probability must be in [0, 1), got {p}"
        )))
    }
}
