//! Key/value cache for incremental decoding.
//!
//! A [`KeyValueCache`] holds the key and value projections that one
//! attention layer computed for earlier positions, together with the
//! padding mask of those positions. The cache is a value:
//! extending it returns a new cache and leaves the original untouched, so a
//! caller can keep several continuations of the same prefix alive (for
//! example during beam search).
//!
//! ## Memory Layout
//!
//! Keys and values are stored with shape
//! `[batch, n_key_value_heads, cached_len, head_width]`. With grouped-query
//! attention only the key/value heads are cached, not the broadcast copies.
//! Keys are stored after rotary embeddings have been applied. The mask has
//! shape `[batch, cached_len]` (`u8`, non-zero for pieces that may be
//! attended to).

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

/// Cached key/value projections of one attention layer.
#[derive(Debug, Clone)]
pub struct KeyValueCache {
    /// Key cache: [batch, n_key_value_heads, cached_len, head_width]
    key: Tensor,
    /// Value cache: [batch, n_key_value_heads, cached_len, head_width]
    value: Tensor,
    /// Padding mask of the cached positions: [batch, cached_len]
    mask: Tensor,
}

impl KeyValueCache {
    /// Creates a cache from key and value tensors of identical rank-4 shape.
    /// Every cached position is treated as valid.
    pub fn new(key: Tensor, value: Tensor) -> Result<Self> {
        check_key_value(&key, &value)?;
        let (batch_size, _, seq_len, _) = key.dims4()?;
        let mask = Tensor::ones((batch_size, seq_len), DType::U8, key.device())?;
        Ok(Self { key, value, mask })
    }

    /// Creates a cache whose positions carry the padding mask `mask`
    /// [batch, seq_len].
    pub fn with_mask(key: Tensor, value: Tensor, mask: Tensor) -> Result<Self> {
        check_key_value(&key, &value)?;
        let mask = check_mask(&key, &mask)?;
        Ok(Self { key, value, mask })
    }

    /// Creates an empty cache that can be extended with projections of the
    /// given geometry.
    pub fn empty(
        batch_size: usize,
        n_key_value_heads: usize,
        head_width: usize,
        dtype: candle_core::DType,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let shape = (batch_size, n_key_value_heads, 0, head_width);
        Ok(Self {
            key: Tensor::zeros(shape, dtype, device)?,
            value: Tensor::zeros(shape, dtype, device)?,
            mask: Tensor::zeros((batch_size, 0), DType::U8, device)?,
        })
    }

    /// Cached keys.
    pub fn key(&self) -> &Tensor {
        &self.key
    }

    /// Cached values.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Padding mask of the cached positions [batch, cached_len].
    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    /// Number of cached positions.
    pub fn len(&self) -> usize {
        self.key.dims()[2]
    }

    /// Returns true if no positions are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batch size of the cached projections.
    pub fn batch_size(&self) -> usize {
        self.key.dims()[0]
    }

    /// Returns a new cache with `key` and `value` appended along the
    /// sequence axis. The new positions are treated as valid.
    ///
    /// The new projections must match the cache in batch size, number of
    /// heads and head width.
    pub fn extend(&self, key: &Tensor, value: &Tensor) -> Result<Self> {
        let dims = key.dims();
        if dims.len() != 4 {
            return Err(Error::shape(format!(
                "cannot extend cache with key of shape {dims:?}"
            )));
        }
        let mask = Tensor::ones((dims[0], dims[2]), DType::U8, key.device())?;
        self.extend_with_mask(key, value, &mask)
    }

    /// Like [`KeyValueCache::extend`], with `mask` [batch, seq_len] marking
    /// which of the new positions are padding.
    pub fn extend_with_mask(&self, key: &Tensor, value: &Tensor, mask: &Tensor) -> Result<Self> {
        let cached = self.key.dims();
        for (what, new) in [("key", key), ("value", value)] {
            let dims = new.dims();
            if dims.len() != 4 || dims[0] != cached[0] || dims[1] != cached[1] || dims[3] != cached[3]
            {
                return Err(Error::shape(format!(
                    "cannot extend cache of shape {cached:?} with {what} of shape {dims:?}"
                )));
            }
        }
        if key.dims()[2] != value.dims()[2] {
            return Err(Error::shape(format!(
                "key length {} and value length {} differ",
                key.dims()[2],
                value.dims()[2]
            )));
        }
        let mask = check_mask(key, mask)?;
        Ok(Self {
            key: Tensor::cat(&[&self.key, key], 2)?,
            value: Tensor::cat(&[&self.value, value], 2)?,
            mask: Tensor::cat(&[&self.mask, &mask], 1)?,
        })
    }

    /// Returns a cache holding only the batch items at `indices`, in that
    /// order. Indices may repeat, which duplicates a hypothesis.
    pub fn select_batch(&self, indices: &[u32]) -> Result<Self> {
        let batch_size = self.batch_size();
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= batch_size) {
            return Err(Error::shape(format!(
                "batch index {bad} out of range for cache with batch size {batch_size}"
            )));
        }
        let indices = Tensor::new(indices, self.key.device())?;
        Ok(Self {
            key: self.key.index_select(&indices, 0)?,
            value: self.value.index_select(&indices, 0)?,
            mask: self.mask.index_select(&indices, 0)?,
        })
    }
}

fn check_key_value(key: &Tensor, value: &Tensor) -> Result<()> {
    if key.rank() != 4 || key.dims() != value.dims() {
        return Err(Error::shape(format!(
            "cache key {:?} and value {:?} must share a [batch, heads, seq_len, head_width] shape",
            key.dims(),
            value.dims()
        )));
    }
    Ok(())
}

/// Checks that `mask` covers the batch and positions of `key`, and converts
/// it to `u8`.
fn check_mask(key: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let dims = key.dims();
    if mask.dims() != [dims[0], dims[2]] {
        return Err(Error::shape(format!(
            "cache mask {:?} does not cover keys of shape {dims:?}",
            mask.dims()
        )));
    }
    Ok(mask.to_dtype(DType::U8)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_empty_cache() {
        let cache = KeyValueCache::empty(2, 4, 8, DType::F32, &Device::Cpu).unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.batch_size(), 2);
        assert_eq!(cache.key().dims(), &[2, 4, 0, 8]);
    }

    #[test]
    fn test_extend_does_not_modify_original() {
        let device = Device::Cpu;
        let cache = KeyValueCache::empty(1, 2, 4, DType::F32, &device).unwrap();
        let k = Tensor::ones((1, 2, 3, 4), DType::F32, &device).unwrap();

        let extended = cache.extend(&k, &k).unwrap();
        let extended_again = extended.extend(&k, &k).unwrap();

        assert_eq!(cache.len(), 0);
        assert_eq!(extended.len(), 3);
        assert_eq!(extended_again.len(), 6);
    }

    #[test]
    fn test_extend_rejects_mismatched_heads() {
        let device = Device::Cpu;
        let cache = KeyValueCache::empty(1, 2, 4, DType::F32, &device).unwrap();
        let k = Tensor::ones((1, 3, 1, 4), DType::F32, &device).unwrap();
        assert!(matches!(cache.extend(&k, &k), Err(Error::Shape(_))));
    }

    #[test]
    fn test_mask_follows_extend_and_select() {
        let device = Device::Cpu;
        let k = Tensor::ones((2, 1, 2, 4), DType::F32, &device).unwrap();
        let mask = Tensor::new(&[[1u8, 1], [1, 0]], &device).unwrap();
        let cache = KeyValueCache::with_mask(k.clone(), k.clone(), mask).unwrap();

        let step = Tensor::ones((2, 1, 1, 4), DType::F32, &device).unwrap();
        let extended = cache.extend(&step, &step).unwrap();
        let masks: Vec<Vec<u8>> = extended.mask().to_vec2().unwrap();
        assert_eq!(masks, vec![vec![1, 1, 1], vec![1, 0, 1]]);

        let selected = extended.select_batch(&[1, 1]).unwrap();
        let masks: Vec<Vec<u8>> = selected.mask().to_vec2().unwrap();
        assert_eq!(masks, vec![vec![1, 0, 1], vec![1, 0, 1]]);

        let short = Tensor::ones((2, 3), DType::U8, &device).unwrap();
        assert!(matches!(
            cache.extend_with_mask(&step, &step, &short),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn test_new_rejects_mismatched_shapes() {
        let device = Device::Cpu;
        let k = Tensor::ones((1, 2, 3, 4), DType::F32, &device).unwrap();
        let v = Tensor::ones((1, 2, 2, 4), DType::F32, &device).unwrap();
        assert!(KeyValueCache::new(k, v).is_err());
    }
}
