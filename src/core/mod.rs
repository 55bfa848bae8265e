//! Core value types shared by the attention layers.
//!
//! - [`AttentionMask`]: boolean masks over padded batches
//! - [`KeyValueCache`]: per-layer key/value projections for incremental decoding

pub mod kv_cache;
pub mod mask;

pub use kv_cache::KeyValueCache;
pub use mask::AttentionMask;
