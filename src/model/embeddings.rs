//! Input embeddings.
//!
//! ```text
//! piece ids ──► piece embeddings ─┐
//! type ids  ──► type embeddings  ─┼─► sum ─► layer norm ─► dropout ─► projection
//! positions ──► pos. embeddings  ─┘
//! ```
//!
//! Every stage except the piece embeddings is optional. Decoders with rotary
//! embeddings use piece embeddings only.

use candle_core::{DType, Module, Tensor};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};

use crate::config::{EmbeddingsConfig, PositionScheme};
use crate::error::{Error, Result};

/// Embedding layer shared by encoders and decoders.
#[derive(Debug, Clone)]
pub struct TransformerEmbeddings {
    piece_embeddings: Embedding,
    type_embeddings: Option<Embedding>,
    position_embeddings: Option<(Embedding, PositionScheme)>,
    n_positions: usize,
    layer_norm: Option<LayerNorm>,
    /// Maps the embedding width to the hidden width.
    projection: Option<Linear>,
    dropout_prob: f32,
}

impl TransformerEmbeddings {
    pub fn new(config: &EmbeddingsConfig, hidden_width: usize, vb: VarBuilder) -> Result<Self> {
        let width = config.embedding_width;
        let piece_embeddings = embedding(config.n_pieces, width, vb.pp("piece_embeddings"))?;

        let type_embeddings = config
            .n_types
            .map(|n_types| embedding(n_types, width, vb.pp("type_embeddings")))
            .transpose()?;

        let (position_embeddings, n_positions) = match &config.positions {
            Some(positions) => (
                Some((
                    embedding(positions.n_positions, width, vb.pp("position_embeddings"))?,
                    positions.scheme,
                )),
                positions.n_positions,
            ),
            None => (None, 0),
        };

        let layer_norm = config
            .layer_norm_eps
            .map(|eps| layer_norm(width, eps, vb.pp("layer_norm")))
            .transpose()?;

        let projection = if config.projection {
            Some(linear(width, hidden_width, vb.pp("projection"))?)
        } else if width != hidden_width {
            return Err(Error::config(format!(
                "embedding width {width} differs from hidden width {hidden_width} without a projection"
            )));
        } else {
            None
        };

        Ok(Self {
            piece_embeddings,
            type_embeddings,
            position_embeddings,
            n_positions,
            layer_norm,
            projection,
            dropout_prob: config.dropout_prob,
        })
    }

    /// Returns the piece embedding matrix [n_pieces, embedding_width].
    pub fn piece_embeddings(&self) -> &Tensor {
        self.piece_embeddings.embeddings()
    }

    /// Embeds `input_ids` [batch, seq_len] into [batch, seq_len, hidden_width].
    ///
    /// # Arguments
    ///
    /// * `type_ids` - Token type ids; all zeros when absent
    /// * `position_offset` - Position of the first piece for absolute
    ///   position embeddings
    /// * `train` - Apply dropout
    pub fn forward_t(
        &self,
        input_ids: &Tensor,
        type_ids: Option<&Tensor>,
        position_offset: usize,
        train: bool,
    ) -> Result<Tensor> {
        let (batch_size, seq_len) = input_ids.dims2()?;
        let mut embeddings = self.piece_embeddings.forward(input_ids)?;

        if let Some(type_embeddings) = &self.type_embeddings {
            let type_ids = match type_ids {
                Some(type_ids) => {
                    if type_ids.dims() != input_ids.dims() {
                        return Err(Error::shape(format!(
                            "type ids {:?} do not match input ids {:?}",
                            type_ids.dims(),
                            input_ids.dims()
                        )));
                    }
                    type_ids.to_dtype(DType::U32)?
                }
                None => Tensor::zeros((batch_size, seq_len), DType::U32, input_ids.device())?,
            };
            embeddings = (embeddings + type_embeddings.forward(&type_ids)?)?;
        }

        if let Some((position_embeddings, scheme)) = &self.position_embeddings {
            let positions = self.position_ids(input_ids, *scheme, position_offset)?;
            embeddings = embeddings.broadcast_add(&position_embeddings.forward(&positions)?)?;
        }

        if let Some(layer_norm) = &self.layer_norm {
            embeddings = layer_norm.forward(&embeddings)?;
        }

        if train && self.dropout_prob > 0.0 {
            embeddings = candle_nn::ops::dropout(&embeddings, self.dropout_prob)?;
        }

        match &self.projection {
            Some(projection) => Ok(projection.forward(&embeddings)?),
            None => Ok(embeddings),
        }
    }

    /// Position ids: [1, seq_len] for absolute positions, [batch, seq_len]
    /// for padding-aware positions.
    fn position_ids(
        &self,
        input_ids: &Tensor,
        scheme: PositionScheme,
        offset: usize,
    ) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let device = input_ids.device();
        let (positions, max_position) = match scheme {
            PositionScheme::Absolute => (
                Tensor::arange(offset as u32, (offset + seq_len) as u32, device)?.unsqueeze(0)?,
                offset + seq_len,
            ),
            PositionScheme::AfterPadding { padding_id } => {
                // Non-padding pieces count up from padding_id + 1; padding keeps padding_id.
                let ids = input_ids.to_dtype(DType::U32)?;
                let padding = Tensor::full(padding_id, ids.dims(), device)?;
                let mask = ids.ne(&padding)?.to_dtype(DType::F32)?;
                let positions = ((mask.cumsum(1)? * &mask)? + padding_id as f64)?;
                (
                    positions.to_dtype(DType::U32)?,
                    padding_id as usize + seq_len + 1,
                )
            }
        };
        if max_position > self.n_positions {
            return Err(Error::shape(format!(
                "sequence needs {max_position} positions, but only {} position embeddings exist",
                self.n_positions
            )));
        }
        Ok(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PositionEmbeddingsConfig;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn embeddings(config: &EmbeddingsConfig, hidden_width: usize) -> TransformerEmbeddings {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        TransformerEmbeddings::new(config, hidden_width, vb).unwrap()
    }

    fn config(scheme: PositionScheme, embedding_width: usize) -> EmbeddingsConfig {
        EmbeddingsConfig {
            n_pieces: 20,
            embedding_width,
            n_types: Some(2),
            positions: Some(PositionEmbeddingsConfig {
                n_positions: 16,
                scheme,
            }),
            projection: embedding_width != 8,
            layer_norm_eps: Some(1e-12),
            dropout_prob: 0.1,
        }
    }

    #[test]
    fn test_padding_aware_positions() {
        let emb = embeddings(&config(PositionScheme::AfterPadding { padding_id: 1 }, 8), 8);
        let ids = Tensor::new(&[[0u32, 5, 6, 1, 1]], &Device::Cpu).unwrap();
        let positions = emb
            .position_ids(&ids, PositionScheme::AfterPadding { padding_id: 1 }, 0)
            .unwrap();
        let values: Vec<Vec<u32>> = positions.to_vec2().unwrap();
        assert_eq!(values, vec![vec![2, 3, 4, 1, 1]]);
    }

    #[test]
    fn test_absolute_positions_with_offset() {
        let emb = embeddings(&config(PositionScheme::Absolute, 8), 8);
        let ids = Tensor::new(&[[3u32, 4]], &Device::Cpu).unwrap();
        let positions = emb.position_ids(&ids, PositionScheme::Absolute, 3).unwrap();
        let values: Vec<Vec<u32>> = positions.to_vec2().unwrap();
        assert_eq!(values, vec![vec![3, 4]]);
    }

    #[test]
    fn test_too_many_positions() {
        let emb = embeddings(&config(PositionScheme::Absolute, 8), 8);
        let ids = Tensor::zeros((1, 17), DType::U32, &Device::Cpu).unwrap();
        assert!(matches!(
            emb.forward_t(&ids, None, 0, false),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn test_padding_aware_positions_from_i64_ids() {
        let emb = embeddings(&config(PositionScheme::AfterPadding { padding_id: 1 }, 8), 8);
        let ids = Tensor::new(&[[0i64, 5, 1]], &Device::Cpu).unwrap();
        let positions = emb
            .position_ids(&ids, PositionScheme::AfterPadding { padding_id: 1 }, 0)
            .unwrap();
        let values: Vec<Vec<u32>> = positions.to_vec2().unwrap();
        assert_eq!(values, vec![vec![2, 3, 1]]);
    }

    #[test]
    fn test_width_mismatch_requires_projection() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = EmbeddingsConfig {
            projection: false,
            ..config(PositionScheme::Absolute, 4)
        };
        assert!(matches!(
            TransformerEmbeddings::new(&config, 12, vb),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_projection_with_equal_widths() {
        let config = EmbeddingsConfig {
            projection: true,
            ..config(PositionScheme::Absolute, 8)
        };
        let emb = embeddings(&config, 8);
        assert!(emb.projection.is_some());
    }

    #[test]
    fn test_projection_to_hidden_width() {
        let emb = embeddings(&config(PositionScheme::Absolute, 4), 12);
        let ids = Tensor::new(&[[3u32, 4, 5], [6, 7, 8]], &Device::Cpu).unwrap();
        let out = emb.forward_t(&ids, None, 0, false).unwrap();
        assert_eq!(out.dims(), &[2, 3, 12]);
    }
}
