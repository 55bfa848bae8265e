//! Model outputs.

use candle_core::Tensor;

use crate::core::KeyValueCache;

/// Hidden states produced by an encoder or decoder.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Output of the embedding layer [batch, seq_len, hidden_width].
    pub embedding_output: Tensor,
    /// Output of every layer, in layer order.
    pub layer_hidden_states: Vec<Tensor>,
}

impl ModelOutput {
    /// All hidden states, starting with the embedding output.
    pub fn all_hidden_states(&self) -> Vec<&Tensor> {
        std::iter::once(&self.embedding_output)
            .chain(self.layer_hidden_states.iter())
            .collect()
    }

    /// Hidden states of the last layer, or the embedding output for a model
    /// without layers.
    pub fn last_hidden_layer_state(&self) -> &Tensor {
        self.layer_hidden_states
            .last()
            .unwrap_or(&self.embedding_output)
    }
}

/// Decoder output with the per-layer key/value caches.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    pub output: ModelOutput,
    /// One cache per layer when `store_cache` was set.
    pub cache: Option<Vec<KeyValueCache>>,
}

impl DecoderOutput {
    pub fn last_hidden_layer_state(&self) -> &Tensor {
        self.output.last_hidden_layer_state()
    }

    /// Number of positions held by the caches.
    pub fn cache_len(&self) -> Option<usize> {
        self.cache
            .as_ref()
            .and_then(|caches| caches.first())
            .map(KeyValueCache::len)
    }
}
