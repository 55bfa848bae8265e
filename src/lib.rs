//! curated-candle: transformer building blocks on candle.
//!
//! This crate implements the components shared by ALBERT, Llama, RoBERTa
//! and RefinedWebModel (Falcon) models:
//! - Attention with grouped-query heads, rotary embeddings and key/value caching
//! - Pre-norm decoder and post-norm encoder layers, with parallel attention
//!   and shared layer groups
//! - Conversion of HuggingFace checkpoints to this crate's module layout

pub mod config;
pub mod error;

pub mod convert;
pub mod core;
pub mod model;

pub use config::{
    Activation, AttentionConfig, EmbeddingsConfig, FeedForwardConfig, LayerConfig, LayerVariant,
    NormKind, PositionEmbeddingsConfig, PositionScheme, QkvMode, RotaryEmbeddingConfig,
    TransformerConfig,
};
pub use convert::{AlbertEncoder, FromHf, LlamaDecoder, RefinedWebModelDecoder, RobertaEncoder};
pub use crate::core::{AttentionMask, KeyValueCache};
pub use error::{Error, Result};
pub use model::{DecoderOutput, ModelOutput, TransformerDecoder, TransformerEncoder};
