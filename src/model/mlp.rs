//! Pointwise feed-forward network.
//!
//! Covers both the ungated two-layer MLP of the BERT family and the gated
//! variant (SwiGLU) used by Llama.
//!
//! Reference: <https://arxiv.org/abs/2002.05202>

use candle_core::{Module, Tensor};
use candle_nn::{linear_b, Linear, VarBuilder};

use crate::config::{Activation, FeedForwardConfig};
use crate::error::Result;

/// SiLU (Sigmoid Linear Unit) activation function.
///
/// Also known as Swish: `silu(x) = x * sigmoid(x)`
fn silu(x: &Tensor) -> candle_core::Result<Tensor> {
    x.mul(&candle_nn::ops::sigmoid(x)?)
}

impl Activation {
    /// Applies the activation elementwise.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = match self {
            Activation::Gelu => x.gelu_erf()?,
            Activation::GeluNew => x.gelu()?,
            Activation::Relu => x.relu()?,
            Activation::Silu => silu(x)?,
        };
        Ok(y)
    }
}

/// Feed-forward block applied independently at every position.
///
/// - `intermediate`: projects input to the intermediate width
/// - `gate`: optional projection passed through the activation and
///   multiplied with `intermediate`
/// - `output`: projects back to the hidden width
///
/// Formula (gated): `output(act(gate(x)) * intermediate(x))`
/// Formula (ungated): `output(act(intermediate(x)))`
#[derive(Debug, Clone)]
pub struct PointwiseFeedForward {
    intermediate: Linear,
    gate: Option<Linear>,
    output: Linear,
    activation: Activation,
    hidden_width: usize,
    intermediate_width: usize,
}

impl PointwiseFeedForward {
    /// Loads the block from `vb` using the `intermediate`, `gate` and
    /// `output` sub-paths.
    pub fn new(config: &FeedForwardConfig, hidden_width: usize, vb: VarBuilder) -> Result<Self> {
        let width = config.intermediate_width;
        let intermediate = linear_b(hidden_width, width, config.use_bias, vb.pp("intermediate"))?;
        let gate = if config.use_gate {
            Some(linear_b(hidden_width, width, config.use_bias, vb.pp("gate"))?)
        } else {
            None
        };
        let output = linear_b(width, hidden_width, config.use_bias, vb.pp("output"))?;

        Ok(Self {
            intermediate,
            gate,
            output,
            activation: config.activation,
            hidden_width,
            intermediate_width: width,
        })
    }

    /// Returns the hidden width.
    pub fn hidden_width(&self) -> usize {
        self.hidden_width
    }

    /// Returns the intermediate width.
    pub fn intermediate_width(&self) -> usize {
        self.intermediate_width
    }

    /// Returns true if the block is gated.
    pub fn is_gated(&self) -> bool {
        self.gate.is_some()
    }

    /// Forward pass; `x` has shape [..., hidden_width].
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = match &self.gate {
            Some(gate) => {
                let gated = self.activation.forward(&gate.forward(x)?)?;
                gated.mul(&self.intermediate.forward(x)?)?
            }
            None => self.activation.forward(&self.intermediate.forward(x)?)?,
        };
        Ok(self.output.forward(&hidden)?)
    }
}
