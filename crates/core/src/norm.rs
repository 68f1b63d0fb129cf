//! LayerNorm built from primitive tensor ops.
//!
//! `candle_nn::LayerNorm` dispatches contiguous inputs to a fused kernel that
//! has no backward pass; pretraining needs gradients through every norm, so
//! this version stays on differentiable ops.

use candle_core::{Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// Affine layer normalisation over the last dimension.
///
/// Parameters are stored as `weight` / `bias` under the caller's prefix,
/// which is `LayerNorm` everywhere in BERT.
pub struct BertLayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl BertLayerNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.))?;
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}
