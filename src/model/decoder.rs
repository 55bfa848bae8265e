//! Transformer decoder.
//!
//! ```text
//! Input ids
//!     │
//!     ▼
//! ┌─────────────────┐
//! │   Embeddings    │
//! └─────────────────┘
//!     │
//!     ▼
//! ┌─────────────────┐
//! │  DecoderLayer   │ × n_hidden_layers   ◄── per-layer KeyValueCache
//! └─────────────────┘
//!     │
//!     ▼
//! ┌─────────────────┐
//! │ Output norm     │  applied to the last layer only
//! └─────────────────┘
//! ```

use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::{debug, trace, trace_span};

use super::attention::rotary_embeds;
use super::embeddings::TransformerEmbeddings;
use super::layer::DecoderLayer;
use super::norm::Norm;
use super::output::{DecoderOutput, ModelOutput};
use crate::config::{LayerVariant, TransformerConfig};
use crate::core::{AttentionMask, KeyValueCache};
use crate::error::{Error, Result};

/// Causal transformer decoder.
#[derive(Debug, Clone)]
pub struct TransformerDecoder {
    embeddings: TransformerEmbeddings,
    layers: Vec<DecoderLayer>,
    output_layer_norm: Norm,
    padding_id: Option<u32>,
}

impl TransformerDecoder {
    /// Builds a decoder from a validated config.
    ///
    /// Parameters are read from `embeddings.*`, `layers.{i}.*` and
    /// `output_layer_norm.*`.
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        if let LayerVariant::Grouped { .. } = config.layer.variant {
            return Err(Error::config("decoders do not support grouped layers"));
        }

        let layer_config = &config.layer;
        let embeddings =
            TransformerEmbeddings::new(&config.embedding, layer_config.hidden_width, vb.pp("embeddings"))?;
        let rotary = rotary_embeds(&layer_config.attention, layer_config.hidden_width, vb.device())?;
        let layers = (0..layer_config.n_hidden_layers)
            .map(|i| {
                DecoderLayer::with_rotary_embeds(
                    layer_config,
                    rotary.clone(),
                    vb.pp(format!("layers.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let output_layer_norm = Norm::new(
            layer_config.norm,
            layer_config.hidden_width,
            layer_config.layer_norm_eps,
            vb.pp("output_layer_norm"),
        )?;

        debug!(
            n_layers = layers.len(),
            hidden_width = layer_config.hidden_width,
            variant = ?layer_config.variant,
            "built transformer decoder"
        );

        Ok(Self {
            embeddings,
            layers,
            output_layer_norm,
            padding_id: config.padding_id,
        })
    }

    pub fn embeddings(&self) -> &TransformerEmbeddings {
        &self.embeddings
    }

    pub fn layers(&self) -> &[DecoderLayer] {
        &self.layers
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Inference forward pass. See [`TransformerDecoder::forward_t`].
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&AttentionMask>,
        cache: Option<&[KeyValueCache]>,
        store_cache: bool,
    ) -> Result<DecoderOutput> {
        self.forward_t(input_ids, attention_mask, cache, store_cache, false)
    }

    /// Forward pass through the decoder.
    ///
    /// # Arguments
    ///
    /// * `input_ids` - Piece ids [batch, seq_len], `u32`
    /// * `attention_mask` - Mask over `cache_len + seq_len` keys. Derived
    ///   from the padding id when absent; cached positions count as valid.
    /// * `cache` - One cache per layer from an earlier call
    /// * `store_cache` - Return the extended caches
    /// * `train` - Apply dropout
    pub fn forward_t(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&AttentionMask>,
        cache: Option<&[KeyValueCache]>,
        store_cache: bool,
        train: bool,
    ) -> Result<DecoderOutput> {
        let (batch_size, seq_len) = input_ids.dims2()?;
        let _span = trace_span!("decoder_forward", batch_size, seq_len).entered();

        if let Some(cache) = cache {
            if cache.len() != self.layers.len() {
                return Err(Error::shape(format!(
                    "got {} caches for {} layers",
                    cache.len(),
                    self.layers.len()
                )));
            }
        }
        let cache_len = cache
            .and_then(|cache| cache.first())
            .map(KeyValueCache::len)
            .unwrap_or(0);

        let mask = match attention_mask {
            Some(mask) => mask.clone(),
            None => self.derive_mask(input_ids, cache.and_then(|cache| cache.first()))?,
        };

        let embedding_output = self.embeddings.forward_t(input_ids, None, cache_len, train)?;
        trace!(cache_len, "embedded input");

        let mut layer_hidden_states = Vec::with_capacity(self.layers.len());
        let mut new_cache = store_cache.then(|| Vec::with_capacity(self.layers.len()));
        let mut hidden = embedding_output.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            let layer_cache = cache.map(|cache| &cache[i]);
            let out = layer.forward_t(&hidden, &mask, layer_cache, store_cache, train)?;
            hidden = out.hidden_states;
            layer_hidden_states.push(hidden.clone());
            if let (Some(new_cache), Some(layer_cache)) = (new_cache.as_mut(), out.cache) {
                new_cache.push(layer_cache);
            }
        }

        if let Some(last) = layer_hidden_states.last_mut() {
            *last = self.output_layer_norm.forward(last)?;
        }

        Ok(DecoderOutput {
            output: ModelOutput {
                embedding_output,
                layer_hidden_states,
            },
            cache: new_cache,
        })
    }

    /// Padding mask for the new pieces, prefixed with the padding mask of
    /// the cached positions.
    fn derive_mask(
        &self,
        input_ids: &Tensor,
        cache: Option<&KeyValueCache>,
    ) -> Result<AttentionMask> {
        let (batch_size, seq_len) = input_ids.dims2()?;
        let new_mask = match self.padding_id {
            Some(padding_id) => AttentionMask::from_input_ids(input_ids, padding_id)?,
            None => AttentionMask::all_valid(batch_size, seq_len, input_ids.device())?,
        };
        match cache {
            Some(cache) if !cache.is_empty() => {
                if cache.batch_size() != batch_size {
                    return Err(Error::shape(format!(
                        "cache batch size {} does not match input batch size {batch_size}",
                        cache.batch_size()
                    )));
                }
                let cached = cache.mask().reshape((batch_size, 1, 1, cache.len()))?;
                AttentionMask::new(Tensor::cat(&[&cached, new_mask.bool_mask()], 3)?)
            }
            _ => Ok(new_mask),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Activation, AttentionConfig, EmbeddingsConfig, FeedForwardConfig, LayerConfig, NormKind,
        QkvMode, RotaryEmbeddingConfig,
    };
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn config(variant: LayerVariant) -> TransformerConfig {
        TransformerConfig {
            embedding: EmbeddingsConfig {
                n_pieces: 50,
                embedding_width: 16,
                projection: false,
                n_types: None,
                positions: None,
                layer_norm_eps: None,
                dropout_prob: 0.0,
            },
            layer: LayerConfig {
                hidden_width: 16,
                n_hidden_layers: 2,
                attention: AttentionConfig {
                    n_query_heads: 4,
                    n_key_value_heads: 2,
                    qkv_mode: QkvMode::Separate,
                    dropout_prob: 0.0,
                    use_bias: false,
                    rotary_embeddings: Some(RotaryEmbeddingConfig {
                        rotary_fraction: 1.0,
                        rotary_base: 10000.0,
                        max_positions: 32,
                    }),
                },
                feedforward: FeedForwardConfig {
                    intermediate_width: 32,
                    activation: Activation::Silu,
                    use_bias: false,
                    use_gate: true,
                },
                norm: NormKind::RmsNorm,
                layer_norm_eps: 1e-6,
                dropout_prob: 0.0,
                variant,
            },
            padding_id: Some(0),
        }
    }

    fn decoder(config: &TransformerConfig) -> Result<TransformerDecoder> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        TransformerDecoder::new(config, vb)
    }

    #[test]
    fn test_rejects_grouped_layers() {
        let config = config(LayerVariant::Grouped {
            n_hidden_groups: 1,
            inner_group_size: 1,
        });
        assert!(matches!(decoder(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_forward_outputs_every_layer() {
        let decoder = decoder(&config(LayerVariant::Sequential)).unwrap();
        let ids = Tensor::new(&[[5u32, 6, 7], [8, 9, 0]], &Device::Cpu).unwrap();
        let out = decoder.forward(&ids, None, None, true).unwrap();

        assert_eq!(out.output.layer_hidden_states.len(), 2);
        assert_eq!(out.output.embedding_output.dims(), &[2, 3, 16]);
        assert_eq!(out.last_hidden_layer_state().dims(), &[2, 3, 16]);
        assert_eq!(out.cache.as_ref().unwrap().len(), 2);
        assert_eq!(out.cache_len(), Some(3));
    }

    #[test]
    fn test_derived_mask_keeps_cached_padding() {
        let device = Device::Cpu;
        let decoder = decoder(&config(LayerVariant::ParallelAttention)).unwrap();
        let key = Tensor::zeros((1, 2, 3, 4), DType::F32, &device).unwrap();
        let cached_mask = Tensor::new(&[[1u8, 0, 1]], &device).unwrap();
        let cache = KeyValueCache::with_mask(key.clone(), key, cached_mask).unwrap();

        let ids = Tensor::new(&[[5u32, 0]], &device).unwrap();
        let mask = decoder.derive_mask(&ids, Some(&cache)).unwrap();
        let values: Vec<u8> = mask.bool_mask().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![1, 0, 1, 1, 0]);

        let mask = decoder.derive_mask(&ids, None).unwrap();
        let values: Vec<u8> = mask.bool_mask().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![1, 0]);
    }

    #[test]
    fn test_layers_share_rotary_tables() {
        let decoder = decoder(&config(LayerVariant::Sequential)).unwrap();
        let tables = |i: usize| {
            let rotary = decoder.layers()[i].self_attn().rotary_embeds().unwrap();
            let (cos, sin) = rotary.precomputed();
            (cos.id(), sin.id())
        };
        assert_eq!(tables(0), tables(1));
    }

    #[test]
    fn test_cache_count_must_match_layers() {
        let device = Device::Cpu;
        let decoder = decoder(&config(LayerVariant::Sequential)).unwrap();
        let ids = Tensor::new(&[[5u32]], &device).unwrap();
        let cache = vec![KeyValueCache::empty(1, 2, 4, DType::F32, &device).unwrap()];
        assert!(matches!(
            decoder.forward(&ids, None, Some(&cache), false),
            Err(Error::Shape(_))
        ));
    }
}
