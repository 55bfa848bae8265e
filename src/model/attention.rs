//! Self-attention implementation.
//!
//! This module implements scaled dot-product self-attention with:
//! - Grouped-query / multi-query attention (key/value heads broadcast to
//!   the query heads)
//! - Fused or separate query/key/value projections
//! - Optional rotary position embeddings
//! - Key/value caching for incremental decoding

use candle_core::{Device, Module, Tensor, D};
use candle_nn::{linear_b, Linear, VarBuilder};

use super::rope::QueryKeyRotaryEmbeddings;
use crate::config::{AttentionConfig, QkvMode};
use crate::core::{AttentionMask, KeyValueCache};
use crate::error::{Error, Result};

/// Head configuration of an attention layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionHeads {
    n_query_heads: usize,
    n_key_value_heads: usize,
    qkv_mode: QkvMode,
}

impl AttentionHeads {
    /// Standard multi-head attention: one key/value head per query head.
    pub fn uniform(n_heads: usize, qkv_mode: QkvMode) -> Self {
        Self {
            n_query_heads: n_heads,
            n_key_value_heads: n_heads,
            qkv_mode,
        }
    }

    /// Multi-query attention: a single key/value head shared by all query heads.
    pub fn multi_query(n_query_heads: usize, qkv_mode: QkvMode) -> Self {
        Self {
            n_query_heads,
            n_key_value_heads: 1,
            qkv_mode,
        }
    }

    /// Grouped-query attention: each key/value head is shared by
    /// `n_query_heads / n_key_value_heads` query heads.
    pub fn key_value_broadcast(
        n_query_heads: usize,
        n_key_value_heads: usize,
        qkv_mode: QkvMode,
    ) -> Result<Self> {
        if n_key_value_heads == 0 || n_query_heads % n_key_value_heads != 0 {
            return Err(Error::config(format!(
                "number of query heads ({n_query_heads}) must be a multiple of the number of key/value heads ({n_key_value_heads})"
            )));
        }
        if qkv_mode == QkvMode::MergedSplitBefore && n_query_heads != n_key_value_heads {
            return Err(Error::config(
                "merged split-before projections require uniform attention heads",
            ));
        }
        Ok(Self {
            n_query_heads,
            n_key_value_heads,
            qkv_mode,
        })
    }

    /// Builds the head configuration described by `config`.
    pub fn from_config(config: &AttentionConfig) -> Result<Self> {
        Self::key_value_broadcast(
            config.n_query_heads,
            config.n_key_value_heads,
            config.qkv_mode,
        )
    }

    pub fn n_query_heads(&self) -> usize {
        self.n_query_heads
    }

    pub fn n_key_value_heads(&self) -> usize {
        self.n_key_value_heads
    }

    pub fn qkv_mode(&self) -> QkvMode {
        self.qkv_mode
    }

    /// Number of query heads sharing each key/value head.
    pub fn n_repeats(&self) -> usize {
        self.n_query_heads / self.n_key_value_heads
    }
}

#[derive(Debug, Clone)]
enum QkvProjection {
    Separate {
        query: Linear,
        key: Linear,
        value: Linear,
    },
    Merged(Linear),
}

/// Output of an attention layer or of a transformer layer.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Hidden states [batch, seq_len, hidden_width].
    pub hidden_states: Tensor,
    /// Cache extended with this call's keys and values, when requested.
    pub cache: Option<KeyValueCache>,
}

/// Scaled dot-product self-attention.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    heads: AttentionHeads,
    head_width: usize,
    qkv: QkvProjection,
    output: Linear,
    rotary_embeds: Option<QueryKeyRotaryEmbeddings>,
    /// Whether queries may only attend to earlier positions.
    causal: bool,
    dropout_prob: f32,
    /// 1 / sqrt(head_width).
    scale: f64,
}

/// Rotary embeddings described by `config` for attention over
/// `hidden_width`, if the config has any.
///
/// Layers of one stack can share the result, so the cos/sin tables are
/// computed once.
pub fn rotary_embeds(
    config: &AttentionConfig,
    hidden_width: usize,
    device: &Device,
) -> Result<Option<QueryKeyRotaryEmbeddings>> {
    let head_width = head_width(config, hidden_width)?;
    config
        .rotary_embeddings
        .as_ref()
        .map(|rotary| QueryKeyRotaryEmbeddings::new(rotary, head_width, device))
        .transpose()
}

fn head_width(config: &AttentionConfig, hidden_width: usize) -> Result<usize> {
    let n_heads = config.n_query_heads;
    if n_heads == 0 || hidden_width % n_heads != 0 {
        return Err(Error::config(format!(
            "hidden width ({hidden_width}) must be divisible by the number of query heads ({n_heads})"
        )));
    }
    Ok(hidden_width / n_heads)
}

impl SelfAttention {
    /// Loads an attention layer from `vb`.
    ///
    /// Fused projections are read from `input`, separate ones from `query`,
    /// `key` and `value`; the output projection from `output`.
    pub fn new(
        config: &AttentionConfig,
        hidden_width: usize,
        causal: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let rotary = rotary_embeds(config, hidden_width, vb.device())?;
        Self::with_rotary_embeds(config, hidden_width, causal, rotary, vb)
    }

    /// Like [`SelfAttention::new`], using `rotary_embeds` instead of building
    /// them from `config`.
    pub fn with_rotary_embeds(
        config: &AttentionConfig,
        hidden_width: usize,
        causal: bool,
        rotary_embeds: Option<QueryKeyRotaryEmbeddings>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let heads = AttentionHeads::from_config(config)?;
        let head_width = head_width(config, hidden_width)?;
        if let Some(rotary) = &rotary_embeds {
            if rotary.head_width() != head_width {
                return Err(Error::config(format!(
                    "rotary embeddings for head width {} used with head width {head_width}",
                    rotary.head_width()
                )));
            }
        }
        let kv_width = heads.n_key_value_heads() * head_width;
        let bias = config.use_bias;

        let qkv = match heads.qkv_mode() {
            QkvMode::Separate => QkvProjection::Separate {
                query: linear_b(hidden_width, hidden_width, bias, vb.pp("query"))?,
                key: linear_b(hidden_width, kv_width, bias, vb.pp("key"))?,
                value: linear_b(hidden_width, kv_width, bias, vb.pp("value"))?,
            },
            QkvMode::MergedSplitBefore | QkvMode::MergedSplitAfter => QkvProjection::Merged(
                linear_b(hidden_width, hidden_width + 2 * kv_width, bias, vb.pp("input"))?,
            ),
        };
        let output = linear_b(hidden_width, hidden_width, bias, vb.pp("output"))?;

        Ok(Self {
            heads,
            head_width,
            qkv,
            output,
            rotary_embeds,
            causal,
            dropout_prob: config.dropout_prob,
            scale: 1.0 / (head_width as f64).sqrt(),
        })
    }

    /// Returns the head configuration.
    pub fn heads(&self) -> AttentionHeads {
        self.heads
    }

    /// Returns the head width.
    pub fn head_width(&self) -> usize {
        self.head_width
    }

    /// Returns true if the layer applies a causal mask.
    pub fn is_causal(&self) -> bool {
        self.causal
    }

    /// Returns the output projection.
    pub fn output_projection(&self) -> &Linear {
        &self.output
    }

    /// Returns the rotary embeddings, if any.
    pub fn rotary_embeds(&self) -> Option<&QueryKeyRotaryEmbeddings> {
        self.rotary_embeds.as_ref()
    }

    /// Inference forward pass. See [`SelfAttention::forward_t`].
    pub fn forward(
        &self,
        input: &Tensor,
        attention_mask: &AttentionMask,
        cache: Option<&KeyValueCache>,
        store_cache: bool,
    ) -> Result<AttentionOutput> {
        self.forward_t(input, attention_mask, cache, store_cache, false)
    }

    /// Forward pass through the attention layer.
    ///
    /// # Arguments
    ///
    /// * `input` - Hidden states [batch, seq_len, hidden_width]
    /// * `attention_mask` - Padding mask covering `cache_len + seq_len` keys
    /// * `cache` - Keys and values of earlier positions
    /// * `store_cache` - Return the cache extended with this call's keys and values
    /// * `train` - Apply dropout to the attention weights
    ///
    /// Rotary embeddings are applied at positions offset by the cache length.
    pub fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: &AttentionMask,
        cache: Option<&KeyValueCache>,
        store_cache: bool,
        train: bool,
    ) -> Result<AttentionOutput> {
        let (batch_size, seq_len, _) = input.dims3()?;
        let cache_len = cache.map(KeyValueCache::len).unwrap_or(0);

        // 1. Project to [batch, seq_len, heads, head_width]
        let (q, k, v) = self.project_qkv(input, batch_size, seq_len)?;

        // 2. Rotary embeddings at absolute positions cache_len..cache_len + seq_len
        let (q, k) = match &self.rotary_embeds {
            Some(rotary) => rotary.apply(&q, &k, cache_len)?,
            None => (q, k),
        };

        // 3. [batch, heads, seq_len, head_width]
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        // 4. Padding mask must cover the cached and the new keys
        let kv_len = cache_len + seq_len;
        if attention_mask.key_len() != kv_len
            || (attention_mask.batch_size() != batch_size && attention_mask.batch_size() != 1)
        {
            return Err(Error::shape(format!(
                "attention mask {:?} does not cover batch {batch_size} with {kv_len} keys",
                attention_mask.bool_mask().dims()
            )));
        }

        // 5. Prepend cached keys and values; the cache remembers which new
        // positions are padding
        let new_padding = attention_mask.key_padding(cache_len, seq_len, batch_size)?;
        let (k, v, new_cache) = match cache {
            Some(cache) => {
                if cache.batch_size() != batch_size {
                    return Err(Error::shape(format!(
                        "cache batch size {} does not match input batch size {batch_size}",
                        cache.batch_size()
                    )));
                }
                let extended = cache.extend_with_mask(&k, &v, &new_padding)?;
                (extended.key().clone(), extended.value().clone(), extended)
            }
            None => (
                k.clone(),
                v.clone(),
                KeyValueCache::with_mask(k, v, new_padding)?,
            ),
        };

        // Causal constraint on top of padding
        let mask = if self.causal {
            attention_mask.and(&AttentionMask::causal(seq_len, kv_len, input.device())?)?
        } else {
            attention_mask.clone()
        };

        // 6. Expand K, V for grouped-query attention
        let k = self.repeat_kv(&k)?;
        let v = self.repeat_kv(&v)?;

        // 7. softmax(QK^T / sqrt(d)) V
        let weights = attention_weights(&q, &k, &mask, self.scale)?;
        let weights = if train && self.dropout_prob > 0.0 {
            candle_nn::ops::dropout(&weights, self.dropout_prob)?
        } else {
            weights
        };
        let attn = weights.matmul(&v)?;

        // 8. Merge heads and project
        let attn = attn.transpose(1, 2)?.contiguous()?.reshape((
            batch_size,
            seq_len,
            self.heads.n_query_heads() * self.head_width,
        ))?;
        let hidden_states = self.output.forward(&attn)?;

        Ok(AttentionOutput {
            hidden_states,
            cache: store_cache.then_some(new_cache),
        })
    }

    fn project_qkv(
        &self,
        input: &Tensor,
        batch_size: usize,
        seq_len: usize,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let n_q = self.heads.n_query_heads();
        let n_kv = self.heads.n_key_value_heads();
        let hw = self.head_width;

        let (q, k, v) = match &self.qkv {
            QkvProjection::Separate { query, key, value } => {
                (query.forward(input)?, key.forward(input)?, value.forward(input)?)
            }
            QkvProjection::Merged(proj) => {
                let proj = proj.forward(input)?;
                match self.heads.qkv_mode() {
                    QkvMode::MergedSplitBefore => {
                        // [batch, seq_len, heads, 3 * head_width], per head [q, k, v]
                        let proj = proj.reshape((batch_size, seq_len, n_q, 3 * hw))?;
                        return Ok((
                            proj.narrow(3, 0, hw)?,
                            proj.narrow(3, hw, hw)?,
                            proj.narrow(3, 2 * hw, hw)?,
                        ));
                    }
                    _ => (
                        proj.narrow(2, 0, n_q * hw)?,
                        proj.narrow(2, n_q * hw, n_kv * hw)?,
                        proj.narrow(2, (n_q + n_kv) * hw, n_kv * hw)?,
                    ),
                }
            }
        };

        Ok((
            q.reshape((batch_size, seq_len, n_q, hw))?,
            k.reshape((batch_size, seq_len, n_kv, hw))?,
            v.reshape((batch_size, seq_len, n_kv, hw))?,
        ))
    }

    /// Repeats key/value heads to match the number of query heads.
    ///
    /// Input: [batch, n_key_value_heads, seq_len, head_width]
    /// Output: [batch, n_query_heads, seq_len, head_width]
    ///
    /// Query head `h` reads key/value head `h / n_repeats`.
    fn repeat_kv(&self, x: &Tensor) -> Result<Tensor> {
        let n_rep = self.heads.n_repeats();
        if n_rep == 1 {
            return Ok(x.clone());
        }
        let (batch, n_kv, seq_len, head_width) = x.dims4()?;
        let x = x
            .unsqueeze(2)?
            .expand((batch, n_kv, n_rep, seq_len, head_width))?;
        Ok(x.reshape((batch, n_kv * n_rep, seq_len, head_width))?)
    }
}

/// Attention probabilities `softmax(mask(QK^T * scale))`.
///
/// `q` is [batch, heads, query_len, head_width], `k` is
/// [batch, heads, key_len, head_width]; the result is
/// [batch, heads, query_len, key_len]. Masked keys get exactly zero weight.
pub fn attention_weights(
    q: &Tensor,
    k: &Tensor,
    mask: &AttentionMask,
    scale: f64,
) -> Result<Tensor> {
    let scores = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?)? * scale)?;
    let scores = mask.apply_logit_mask(&scores)?;
    Ok(candle_nn::ops::softmax_last_dim(&scores)?)
}
