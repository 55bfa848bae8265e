//! Boolean attention masks.
//!
//! An [`AttentionMask`] marks which key positions a query may attend to.
//! Masks are stored as `u8` tensors (1 = attend, 0 = masked) in a layout
//! that broadcasts against attention scores of shape
//! `[batch, n_heads, query_len, key_len]`:
//!
//! - padding masks: `[batch, 1, 1, key_len]`
//! - causal masks: `[1, 1, query_len, key_len]`
//!
//! Masks are immutable; combining two masks produces a new one.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Boolean mask over attention key positions.
#[derive(Debug, Clone)]
pub struct AttentionMask {
    /// `u8` mask of rank 4, broadcastable to the score shape.
    bool_mask: Tensor,
}

impl AttentionMask {
    /// Creates a mask from a boolean (`u8`) tensor.
    ///
    /// Accepts either a padding mask of shape `[batch, seq_len]` or an
    /// already expanded mask of rank 4. Non-zero entries are attended to.
    pub fn new(bool_mask: Tensor) -> Result<Self> {
        if bool_mask.dtype() != DType::U8 {
            return Err(Error::shape(format!(
                "attention mask must have dtype u8, got {:?}",
                bool_mask.dtype()
            )));
        }
        let bool_mask = match bool_mask.rank() {
            2 => {
                let (batch, seq_len) = bool_mask.dims2()?;
                bool_mask.reshape((batch, 1, 1, seq_len))?
            }
            4 => bool_mask,
            rank => {
                return Err(Error::shape(format!(
                    "attention mask must have rank 2 or 4, got rank {rank}"
                )))
            }
        };
        Ok(Self { bool_mask })
    }

    /// Derives a padding mask from piece ids: every position whose id differs
    /// from `padding_id` is attended to.
    pub fn from_input_ids(input_ids: &Tensor, padding_id: u32) -> Result<Self> {
        if input_ids.rank() != 2 {
            return Err(Error::shape(format!(
                "input ids must have shape [batch, seq_len], got {:?}",
                input_ids.dims()
            )));
        }
        let ids = input_ids.to_dtype(DType::U32)?;
        let padding = Tensor::full(padding_id, ids.dims(), ids.device())?;
        Self::new(ids.ne(&padding)?)
    }

    /// Creates a padding mask from per-sequence validity flags.
    ///
    /// All rows must have the same length.
    pub fn from_bools(rows: &[Vec<bool>], device: &Device) -> Result<Self> {
        let seq_len = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|row| row.len() != seq_len) {
            return Err(Error::shape("all mask rows must have the same length"));
        }
        let data: Vec<u8> = rows.iter().flatten().map(|&b| u8::from(b)).collect();
        Self::new(Tensor::from_vec(data, (rows.len(), seq_len), device)?)
    }

    /// Creates a mask with every one of `key_len` positions attended to.
    pub fn all_valid(batch_size: usize, key_len: usize, device: &Device) -> Result<Self> {
        Self::new(Tensor::ones((batch_size, key_len), DType::U8, device)?)
    }

    /// Creates a causal mask for `query_len` queries over `key_len` keys.
    ///
    /// Queries are aligned with the last `query_len` keys, so when keys
    /// include `key_len - query_len` cached positions, query `i` may attend
    /// to keys `0..=cached + i`.
    pub fn causal(query_len: usize, key_len: usize, device: &Device) -> Result<Self> {
        if query_len > key_len {
            return Err(Error::shape(format!(
                "causal mask needs at least as many keys ({key_len}) as queries ({query_len})"
            )));
        }
        let offset = key_len - query_len;
        let mask: Vec<u8> = (0..query_len)
            .flat_map(|i| {
                let query_pos = offset + i;
                (0..key_len).map(move |key_pos| u8::from(key_pos <= query_pos))
            })
            .collect();
        Self::new(Tensor::from_vec(mask, (1, 1, query_len, key_len), device)?)
    }

    /// The underlying rank-4 `u8` mask.
    pub fn bool_mask(&self) -> &Tensor {
        &self.bool_mask
    }

    /// Batch dimension of the mask (1 when it broadcasts over the batch).
    pub fn batch_size(&self) -> usize {
        self.bool_mask.dims()[0]
    }

    /// Number of key positions covered by the mask.
    pub fn key_len(&self) -> usize {
        self.bool_mask.dims()[3]
    }

    /// Padding of keys `start..start + len` as a `[batch_size, len]` `u8`
    /// tensor. A key counts as valid when any query may attend to it.
    pub fn key_padding(&self, start: usize, len: usize, batch_size: usize) -> Result<Tensor> {
        let (mask_batch, _, n_queries, _) = self.bool_mask.dims4()?;
        if mask_batch != batch_size && mask_batch != 1 {
            return Err(Error::shape(format!(
                "mask with batch size {mask_batch} does not cover batch size {batch_size}"
            )));
        }
        let keys = self.bool_mask.narrow(3, start, len)?;
        let keys = if n_queries == 1 {
            keys.squeeze(2)?.squeeze(1)?
        } else {
            keys.to_dtype(DType::F32)?.max(2)?.squeeze(1)?.to_dtype(DType::U8)?
        };
        Ok(keys.broadcast_as((batch_size, len))?.contiguous()?)
    }

    /// Combines two masks with a logical AND.
    pub fn and(&self, other: &AttentionMask) -> Result<AttentionMask> {
        let lhs = self.bool_mask.dims();
        let rhs = other.bool_mask.dims();
        for (axis, (&a, &b)) in lhs.iter().zip(rhs.iter()).enumerate() {
            if a != b && a != 1 && b != 1 {
                return Err(Error::shape(format!(
                    "cannot combine masks of shapes {lhs:?} and {rhs:?} (axis {axis})"
                )));
            }
        }
        Ok(Self {
            bool_mask: self.bool_mask.broadcast_mul(&other.bool_mask)?,
        })
    }

    /// Replaces masked attention scores with the lowest finite value of the
    /// score dtype.
    ///
    /// After softmax the masked positions receive exactly zero weight, while
    /// rows in which every key is masked stay finite.
    pub fn apply_logit_mask(&self, scores: &Tensor) -> Result<Tensor> {
        let score_dims = scores.dims();
        let mask_dims = self.bool_mask.dims();
        if score_dims.len() != 4
            || mask_dims
                .iter()
                .zip(score_dims.iter())
                .any(|(&m, &s)| m != s && m != 1)
        {
            return Err(Error::shape(format!(
                "mask of shape {mask_dims:?} does not broadcast to scores of shape {score_dims:?}"
            )));
        }
        let mask = self.bool_mask.broadcast_as(scores.dims())?;
        let fill = Tensor::new(lowest_finite(scores.dtype()), scores.device())?
            .to_dtype(scores.dtype())?
            .broadcast_as(scores.dims())?;
        Ok(mask.where_cond(scores, &fill)?)
    }
}

fn lowest_finite(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => -65504.0,
        DType::BF16 => -3.389_531_4e38,
        DType::F64 => f64::MIN,
        _ => f32::MIN as f64,
    }
}
