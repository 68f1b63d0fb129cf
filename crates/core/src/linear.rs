//! Dense layers with BERT initialisation.
//!
//! Weights are drawn from `N(0, initializer_range)` and biases start at zero,
//! matching the reference `_init_weights`. Stored as `weight` `(out, in)` and
//! `bias` `(out,)` so HuggingFace checkpoints load without renaming.

use candle_core::{Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

pub fn normal_init(initializer_range: f64) -> Init {
    Init::Randn {
        mean: 0.,
        stdev: initializer_range,
    }
}

/// `Linear` layer with weight and bias created (or loaded) under `vb`.
pub fn dense(in_dim: usize, out_dim: usize, initializer_range: f64, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", normal_init(initializer_range))?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Embedding table `(num, dim)` stored as `weight`.
pub fn embedding_table(num: usize, dim: usize, initializer_range: f64, vb: VarBuilder) -> Result<Tensor> {
    vb.get_with_hints((num, dim), "weight", normal_init(initializer_range))
}
