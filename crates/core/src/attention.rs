//! Bidirectional multi-head self-attention.
//!
//! Padding is excluded through an additive bias of shape `(b, 1, 1, t)`
//! built once per forward pass by [`attention_bias`].

use candle_core::{Result, Tensor, D};
use candle_nn::{Dropout, Linear, Module, VarBuilder};

use mlm_common::BertConfig;

use crate::linear::dense;

/// Additive mask value for padded key positions.
const MASKED_SCORE: f64 = -10000.0;

/// Turn a `(b, t)` 1/0 input mask into the additive bias `(b, 1, 1, t)`:
/// 0 for real tokens, -10000 for padding.
pub fn attention_bias(input_mask: &Tensor) -> Result<Tensor> {
    let (b, t) = input_mask.dims2()?;
    input_mask
        .affine(-MASKED_SCORE, MASKED_SCORE)?
        .reshape((b, 1, 1, t))
}

/// `attention.self.{query,key,value}`.
pub struct BertSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl BertSelfAttention {
    pub fn new(config: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_size;
        let r = config.initializer_range;
        let head_dim = config.head_dim();
        Ok(Self {
            query: dense(h, h, r, vb.pp("query"))?,
            key: dense(h, h, r, vb.pp("key"))?,
            value: dense(h, h, r, vb.pp("value"))?,
            dropout: Dropout::new(config.attention_probs_dropout_prob),
            num_heads: config.num_attention_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    fn split_heads(&self, x: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        x.reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `x`: `(b, t, hidden)`, `bias`: `(b, 1, 1, t)` → context `(b, t, hidden)`.
    pub fn forward(&self, x: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;
        let q = self.split_heads(&self.query.forward(x)?, b, t)?;
        let k = self.split_heads(&self.key.forward(x)?, b, t)?;
        let v = self.split_heads(&self.value.forward(x)?, b, t)?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let scores = scores.broadcast_add(bias)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let probs = self.dropout.forward(&probs, train)?;

        let context = probs.matmul(&v)?;
        context.transpose(1, 2)?.contiguous()?.reshape((b, t, c))
    }
}
