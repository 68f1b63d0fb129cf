//! Transformer encoder stack: post-norm layers as in the original BERT.
//!
//! ```text
//! a = LN(x + dropout(W_o · attn(x)))
//! y = LN(a + dropout(W_2 · act(W_1 · a)))
//! ```

use candle_core::{Result, Tensor};
use candle_nn::{Dropout, Linear, Module, VarBuilder};

use mlm_common::BertConfig;

use crate::activation::HiddenAct;
use crate::attention::BertSelfAttention;
use crate::linear::dense;
use crate::norm::BertLayerNorm;

/// `dense → dropout → residual → LayerNorm`, shared by the attention and FFN outputs.
struct ResidualOutput {
    dense: Linear,
    layer_norm: BertLayerNorm,
    dropout: Dropout,
}

impl ResidualOutput {
    fn new(in_dim: usize, config: &BertConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense: dense(in_dim, config.hidden_size, config.initializer_range, vb.pp("dense"))?,
            layer_norm: BertLayerNorm::new(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?,
            dropout: Dropout::new(config.hidden_dropout_prob),
        })
    }

    fn forward(&self, hidden: &Tensor, residual: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.dense.forward(hidden)?;
        let x = self.dropout.forward(&x, train)?;
        self.layer_norm.forward(&(x + residual)?)
    }
}

pub struct BertLayer {
    attention: BertSelfAttention,
    attention_output: ResidualOutput,
    intermediate: Linear,
    act: HiddenAct,
    output: ResidualOutput,
}

impl BertLayer {
    pub fn new(config: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let attn_vb = vb.pp("attention");
        Ok(Self {
            attention: BertSelfAttention::new(config, attn_vb.pp("self"))?,
            attention_output: ResidualOutput::new(config.hidden_size, config, attn_vb.pp("output"))?,
            intermediate: dense(
                config.hidden_size,
                config.intermediate_size,
                config.initializer_range,
                vb.pp("intermediate").pp("dense"),
            )?,
            act: HiddenAct::from_name(&config.hidden_act)?,
            output: ResidualOutput::new(config.intermediate_size, config, vb.pp("output"))?,
        })
    }

    pub fn forward(&self, x: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor> {
        let context = self.attention.forward(x, bias, train)?;
        let a = self.attention_output.forward(&context, x, train)?;
        let inner = self.act.apply(&self.intermediate.forward(&a)?)?;
        self.output.forward(&inner, &a, train)
    }
}

pub struct BertEncoder {
    layers: Vec<BertLayer>,
}

impl BertEncoder {
    pub fn new(config: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let layers = (0..config.num_hidden_layers)
            .map(|i| BertLayer::new(config, vb.pp(format!("layer.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn forward(&self, x: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in &self.layers {
            x = layer.forward(&x, bias, train)?;
        }
        Ok(x)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}
