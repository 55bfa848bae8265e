//! Transformer building blocks.
//!
//! This module contains:
//! - Attention (grouped-query heads, rotary embeddings, key/value caching)
//! - Feed-forward, normalization and embedding layers
//! - Decoder and encoder layers and stacks
//! - Checkpoint loading

pub mod attention;
pub mod decoder;
pub mod embeddings;
pub mod encoder;
pub mod layer;
pub mod loader;
pub mod mlp;
pub mod norm;
pub mod output;
pub mod rope;

pub use attention::{
    attention_weights, rotary_embeds, AttentionHeads, AttentionOutput, SelfAttention,
};
pub use decoder::TransformerDecoder;
pub use embeddings::TransformerEmbeddings;
pub use encoder::TransformerEncoder;
pub use layer::{DecoderLayer, EncoderLayer, LayerGroup};
pub use loader::{load_config, load_safetensors, CheckpointFiles};
pub use mlp::PointwiseFeedForward;
pub use norm::{Norm, RmsNorm};
pub use output::{DecoderOutput, ModelOutput};
pub use rope::{apply_rotation, QueryKeyRotaryEmbeddings};
