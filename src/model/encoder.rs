//! Transformer encoder.
//!
//! Encoders run every layer without a causal mask. In a grouped stack
//! (ALBERT), `n_hidden_layers` layer positions share `n_hidden_groups`
//! parameter groups: position `i` applies group
//! `i / (n_hidden_layers / n_hidden_groups)`.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::{debug, trace_span};

use super::attention::rotary_embeds;
use super::embeddings::TransformerEmbeddings;
use super::layer::{EncoderLayer, LayerGroup};
use super::output::ModelOutput;
use crate::config::{LayerVariant, TransformerConfig};
use crate::core::AttentionMask;
use crate::error::{Error, Result};

/// Bidirectional transformer encoder.
#[derive(Debug, Clone)]
pub struct TransformerEncoder {
    embeddings: TransformerEmbeddings,
    groups: Vec<LayerGroup>,
    n_hidden_layers: usize,
    layers_per_group: usize,
    padding_id: Option<u32>,
}

impl TransformerEncoder {
    /// Builds an encoder from a validated config.
    ///
    /// Ungrouped stacks read `layers.{i}.*`; grouped stacks read
    /// `groups.{g}.group_layers.{j}.*`.
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let layer_config = &config.layer;
        let rotary = rotary_embeds(&layer_config.attention, layer_config.hidden_width, vb.device())?;

        let groups = match layer_config.variant {
            LayerVariant::Sequential => (0..layer_config.n_hidden_layers)
                .map(|i| {
                    EncoderLayer::with_rotary_embeds(
                        layer_config,
                        rotary.clone(),
                        vb.pp(format!("layers.{i}")),
                    )
                    .map(LayerGroup::single)
                })
                .collect::<Result<Vec<_>>>()?,
            LayerVariant::Grouped {
                n_hidden_groups,
                inner_group_size,
            } => (0..n_hidden_groups)
                .map(|g| {
                    LayerGroup::new(
                        layer_config,
                        inner_group_size,
                        rotary.as_ref(),
                        vb.pp(format!("groups.{g}")),
                    )
                })
                .collect::<Result<Vec<_>>>()?,
            LayerVariant::ParallelAttention => {
                return Err(Error::config("encoders do not support parallel attention"))
            }
        };

        let embeddings = TransformerEmbeddings::new(
            &config.embedding,
            layer_config.hidden_width,
            vb.pp("embeddings"),
        )?;

        debug!(
            n_layers = layer_config.n_hidden_layers,
            n_groups = groups.len(),
            hidden_width = layer_config.hidden_width,
            "built transformer encoder"
        );

        Ok(Self {
            embeddings,
            groups,
            n_hidden_layers: layer_config.n_hidden_layers,
            layers_per_group: layer_config.layers_per_group(),
            padding_id: config.padding_id,
        })
    }

    pub fn embeddings(&self) -> &TransformerEmbeddings {
        &self.embeddings
    }

    /// Distinct parameter groups, in order.
    pub fn groups(&self) -> &[LayerGroup] {
        &self.groups
    }

    /// Number of layer positions (at least the number of groups).
    pub fn n_layers(&self) -> usize {
        self.n_hidden_layers
    }

    /// The group applied at layer position `layer`.
    pub fn group_for_layer(&self, layer: usize) -> Option<&LayerGroup> {
        if layer >= self.n_hidden_layers {
            return None;
        }
        self.groups.get(layer / self.layers_per_group)
    }

    /// Inference forward pass. See [`TransformerEncoder::forward_t`].
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&AttentionMask>,
        type_ids: Option<&Tensor>,
    ) -> Result<ModelOutput> {
        self.forward_t(input_ids, attention_mask, type_ids, false)
    }

    /// Forward pass through the encoder.
    ///
    /// # Arguments
    ///
    /// * `input_ids` - Piece ids [batch, seq_len], `u32`
    /// * `attention_mask` - Padding mask; derived from the padding id when
    ///   absent
    /// * `type_ids` - Token type ids [batch, seq_len]
    /// * `train` - Apply dropout
    pub fn forward_t(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&AttentionMask>,
        type_ids: Option<&Tensor>,
        train: bool,
    ) -> Result<ModelOutput> {
        let (batch_size, seq_len) = input_ids.dims2()?;
        let _span = trace_span!("encoder_forward", batch_size, seq_len).entered();

        let mask = match (attention_mask, self.padding_id) {
            (Some(mask), _) => mask.clone(),
            (None, Some(padding_id)) => AttentionMask::from_input_ids(input_ids, padding_id)?,
            (None, None) => AttentionMask::all_valid(batch_size, seq_len, input_ids.device())?,
        };

        let embedding_output = self.embeddings.forward_t(input_ids, type_ids, 0, train)?;

        let mut layer_hidden_states = Vec::with_capacity(self.n_hidden_layers);
        let mut hidden = embedding_output.clone();
        for layer in 0..self.n_hidden_layers {
            let group = self.group_for_layer(layer).ok_or_else(|| {
                Error::config(format!("no layer group for layer position {layer}"))
            })?;
            hidden = group.forward_t(&hidden, &mask, train)?;
            layer_hidden_states.push(hidden.clone());
        }

        Ok(ModelOutput {
            embedding_output,
            layer_hidden_states,
        })
    }
}
