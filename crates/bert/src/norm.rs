use candle_core::{Result, Tensor, D};
use candle_nn::{Init, Module, VarBuilder};

/// LayerNorm over the hidden axis, written with differentiable primitives.
#[derive(Debug, Clone)]
pub(crate) struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub(crate) fn new(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(hidden_size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }
}

impl Module for LayerNorm {
    fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let size = hidden.dim(D::Minus1)? as f64;
        let mean = (hidden.sum_keepdim(D::Minus1)? / size)?;
        let centered = hidden.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / size)?;
        let denom = (variance + self.eps)?.sqrt()?;
        centered
            .broadcast_div(&denom)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}
