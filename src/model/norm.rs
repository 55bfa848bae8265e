//! Normalization layers.
//!
//! Root Mean Square Layer Normalization is a simplified version of LayerNorm
//! that only rescales inputs by their RMS value, without centering (no mean subtraction).
//! Llama uses it; the BERT family and RefinedWebModel use regular layer norm.
//!
//! Reference: <https://arxiv.org/abs/1910.07467>

use candle_core::{Module, Tensor};
use candle_nn::{layer_norm, Init, LayerNorm, VarBuilder};

use crate::config::NormKind;
use crate::error::Result;

/// RMS Normalization layer.
///
/// Formula: `output = (x / rms(x)) * weight`
/// where `rms(x) = sqrt(mean(x^2) + eps)`
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter [hidden_size].
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
}

impl RmsNorm {
    /// Loads the `weight` of an RmsNorm layer; fresh variables start at one.
    pub fn new(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    /// Returns a reference to the weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Returns the epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Applies RMS normalization to the input tensor.
    ///
    /// ```text
    /// rms = sqrt(mean(x^2, dim=-1, keepdim=True) + eps)
    /// output = (x / rms) * weight
    /// ```
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let variance = x.sqr()?.mean_keepdim(candle_core::D::Minus1)?;
        let rms = (variance + self.eps)?.sqrt()?;
        let normalized = x.broadcast_div(&rms)?;
        Ok(normalized.broadcast_mul(&self.weight)?)
    }
}

/// Either normalization flavour, selected by [`NormKind`].
#[derive(Debug, Clone)]
pub enum Norm {
    Layer(LayerNorm),
    Rms(RmsNorm),
}

impl Norm {
    /// Loads a normalization layer of the given kind from `vb`.
    ///
    /// Layer norms read `weight` and `bias`; RMS norms read `weight`.
    pub fn new(kind: NormKind, width: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(match kind {
            NormKind::LayerNorm => Norm::Layer(layer_norm(width, eps, vb)?),
            NormKind::RmsNorm => Norm::Rms(RmsNorm::new(width, eps, vb)?),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Norm::Layer(norm) => Ok(norm.forward(x)?),
            Norm::Rms(norm) => norm.forward(x),
        }
    }
}
