//! Rotary Position Embeddings (RoPE) implementation.
//!
//! RoPE encodes position information by rotating pairs of elements in the
//! query and key vectors. This allows the model to understand relative
//! positions through the dot product of rotated vectors.
//!
//! Only the first `rotary_width` dimensions of each head are rotated; the
//! remaining dimensions pass through unchanged (partial rotary embeddings).
//!
//! Reference: <https://arxiv.org/abs/2104.09864>

use candle_core::{DType, Device, Tensor};

use crate::config::RotaryEmbeddingConfig;
use crate::error::{Error, Result};

/// Rotary embeddings applied to query and key projections.
///
/// Key insight: `dot(rotate(q, pos_q), rotate(k, pos_k))` depends on
/// `pos_q - pos_k`, naturally capturing relative position.
#[derive(Debug, Clone)]
pub struct QueryKeyRotaryEmbeddings {
    /// Precomputed cosine values [max_positions, rotary_width].
    cos_cache: Tensor,
    /// Precomputed sine values [max_positions, rotary_width].
    sin_cache: Tensor,
    /// Number of rotated dimensions per head (even).
    rotary_width: usize,
    /// Full head width.
    head_width: usize,
    /// Base frequency.
    base: f64,
}

impl QueryKeyRotaryEmbeddings {
    /// Creates rotary embeddings with precomputed cos/sin tables.
    ///
    /// Fails with a configuration error when the rotary fraction does not
    /// yield an even, non-zero number of rotated dimensions.
    pub fn new(config: &RotaryEmbeddingConfig, head_width: usize, device: &Device) -> Result<Self> {
        let rotary_width = config.rotary_width(head_width)?;
        let (cos_cache, sin_cache) = tables(
            config.rotary_base,
            rotary_width,
            0,
            config.max_positions,
            device,
        )?;
        Ok(Self {
            cos_cache,
            sin_cache,
            rotary_width,
            head_width,
            base: config.rotary_base,
        })
    }

    /// Number of rotated dimensions per head.
    pub fn rotary_width(&self) -> usize {
        self.rotary_width
    }

    /// Head width the embeddings rotate.
    pub fn head_width(&self) -> usize {
        self.head_width
    }

    /// Precomputed cosine and sine tables [max_positions, rotary_width].
    ///
    /// Clones of the embeddings share these tables.
    pub fn precomputed(&self) -> (&Tensor, &Tensor) {
        (&self.cos_cache, &self.sin_cache)
    }

    /// Number of positions covered by the precomputed tables.
    pub fn max_positions(&self) -> usize {
        self.cos_cache.dims()[0]
    }

    /// Cosine and sine tables for positions `offset..offset + len`, each of
    /// shape `[len, rotary_width]`.
    ///
    /// Positions beyond the precomputed range are computed on demand.
    pub fn cos_sin(&self, offset: usize, len: usize) -> Result<(Tensor, Tensor)> {
        if offset + len <= self.max_positions() {
            Ok((
                self.cos_cache.narrow(0, offset, len)?,
                self.sin_cache.narrow(0, offset, len)?,
            ))
        } else {
            tables(
                self.base,
                self.rotary_width,
                offset,
                len,
                self.cos_cache.device(),
            )
        }
    }

    /// Applies rotary embedding to query and key tensors.
    ///
    /// # Arguments
    ///
    /// * `q` - Query tensor [batch, seq_len, n_query_heads, head_width]
    /// * `k` - Key tensor [batch, seq_len, n_key_value_heads, head_width]
    /// * `offset` - Absolute position of the first piece; the cache length
    ///   during incremental decoding
    ///
    /// # Returns
    ///
    /// Tuple of rotated (q, k) tensors with same shapes as input.
    pub fn apply(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let (_, seq_len, _, q_width) = q.dims4()?;
        let (_, k_len, _, k_width) = k.dims4()?;
        if q_width != self.head_width || k_width != self.head_width || k_len != seq_len {
            return Err(Error::shape(format!(
                "rotary embeddings for head width {} cannot rotate q {:?} and k {:?}",
                self.head_width,
                q.dims(),
                k.dims()
            )));
        }

        let (cos, sin) = self.cos_sin(offset, seq_len)?;
        // [1, seq_len, 1, rotary_width]
        let cos = cos.to_dtype(q.dtype())?.unsqueeze(0)?.unsqueeze(2)?;
        let sin = sin.to_dtype(q.dtype())?.unsqueeze(0)?.unsqueeze(2)?;

        Ok((self.rotate(q, &cos, &sin)?, self.rotate(k, &cos, &sin)?))
    }

    fn rotate(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        if self.rotary_width == self.head_width {
            return apply_rotation(x, cos, sin);
        }
        let last = x.rank() - 1;
        let rot = x.narrow(last, 0, self.rotary_width)?;
        let pass = x.narrow(last, self.rotary_width, self.head_width - self.rotary_width)?;
        let rot = apply_rotation(&rot, cos, sin)?;
        Ok(Tensor::cat(&[&rot, &pass], last)?)
    }
}

/// Rotates `x` by the angles encoded in `cos` and `sin`.
///
/// Formula: `x_rot = x * cos + rotate_half(x) * sin`, where
/// `rotate_half([x1, x2]) = [-x2, x1]` pairs dimension `i` with `i + d/2`.
/// Passing `-sin` applies the inverse rotation.
pub fn apply_rotation(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let x_cos = x.broadcast_mul(cos)?;
    let x_sin = rotate_half(x)?.broadcast_mul(sin)?;
    Ok((x_cos + x_sin)?)
}

fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let last = x.rank() - 1;
    let half = x.dims()[last] / 2;
    let x1 = x.narrow(last, 0, half)?;
    let x2 = x.narrow(last, half, half)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], last)?)
}

/// Computes cos/sin tables of shape `[len, width]` for positions starting at
/// `start`.
fn tables(
    base: f64,
    width: usize,
    start: usize,
    len: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    // 1 / base^(2i/width) for each rotated pair.
    let inv_freq: Vec<f32> = (0..width / 2)
        .map(|i| (1.0 / base.powf(2.0 * i as f64 / width as f64)) as f32)
        .collect();
    let inv_freq = Tensor::new(inv_freq.as_slice(), device)?.reshape((1, width / 2))?;

    let positions: Vec<f32> = (start..start + len).map(|p| p as f32).collect();
    let positions = Tensor::new(positions.as_slice(), device)?.reshape((len, 1))?;

    // [len, width/2] duplicated to [len, width]: each angle drives dims i and i + width/2.
    let freqs = positions.broadcast_mul(&inv_freq)?;
    let freqs = Tensor::cat(&[&freqs, &freqs], 1)?;

    Ok((
        freqs.cos()?.to_dtype(DType::F32)?,
        freqs.sin()?.to_dtype(DType::F32)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotary(fraction: f64, max_positions: usize) -> RotaryEmbeddingConfig {
        RotaryEmbeddingConfig {
            rotary_fraction: fraction,
            rotary_base: 10000.0,
            max_positions,
        }
    }

    #[test]
    fn test_table_shapes() {
        let rope = QueryKeyRotaryEmbeddings::new(&rotary(1.0, 64), 16, &Device::Cpu).unwrap();
        let (cos, sin) = rope.cos_sin(0, 64).unwrap();
        assert_eq!(cos.dims(), &[64, 16]);
        assert_eq!(sin.dims(), &[64, 16]);
    }

    #[test]
    fn test_positions_beyond_table_match_precomputed() {
        let device = Device::Cpu;
        let small = QueryKeyRotaryEmbeddings::new(&rotary(1.0, 4), 8, &device).unwrap();
        let large = QueryKeyRotaryEmbeddings::new(&rotary(1.0, 32), 8, &device).unwrap();

        let (cos_a, sin_a) = small.cos_sin(10, 3).unwrap();
        let (cos_b, sin_b) = large.cos_sin(10, 3).unwrap();

        let diff = (cos_a - cos_b).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
        let diff = (sin_a - sin_b).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn test_partial_rotation_keeps_tail() {
        let device = Device::Cpu;
        let rope = QueryKeyRotaryEmbeddings::new(&rotary(0.5, 16), 8, &device).unwrap();
        assert_eq!(rope.rotary_width(), 4);

        let x = Tensor::randn(0.0f32, 1.0, (1, 3, 2, 8), &device).unwrap();
        let (q, _) = rope.apply(&x, &x, 5).unwrap();

        let tail_in: Vec<f32> = x.narrow(3, 4, 4).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let tail_out: Vec<f32> = q.narrow(3, 4, 4).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(tail_in, tail_out);
    }

    #[test]
    fn test_position_zero_is_identity() {
        let device = Device::Cpu;
        let rope = QueryKeyRotaryEmbeddings::new(&rotary(1.0, 16), 8, &device).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (1, 1, 2, 8), &device).unwrap();
        let (q, _) = rope.apply(&x, &x, 0).unwrap();
        let diff = (q - &x).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn test_head_width_mismatch() {
        let device = Device::Cpu;
        let rope = QueryKeyRotaryEmbeddings::new(&rotary(1.0, 16), 8, &device).unwrap();
        let x = Tensor::zeros((1, 2, 2, 6), DType::F32, &device).unwrap();
        assert!(matches!(rope.apply(&x, &x, 0), Err(Error::Shape(_))));
    }
}
