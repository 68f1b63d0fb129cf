//! Word + position + token-type embeddings.

use candle_core::{Error, Result, Tensor};
use candle_nn::{Dropout, Embedding, Module, VarBuilder};

use mlm_common::BertConfig;

use crate::linear::embedding_table;
use crate::norm::BertLayerNorm;

pub struct BertEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: BertLayerNorm,
    dropout: Dropout,
    max_positions: usize,
}

impl BertEmbeddings {
    pub fn new(config: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_size;
        let r = config.initializer_range;
        let word = embedding_table(config.vocab_size, h, r, vb.pp("word_embeddings"))?;
        let position =
            embedding_table(config.max_position_embeddings, h, r, vb.pp("position_embeddings"))?;
        let token_type = embedding_table(config.type_vocab_size, h, r, vb.pp("token_type_embeddings"))?;
        Ok(Self {
            word_embeddings: Embedding::new(word, h),
            position_embeddings: Embedding::new(position, h),
            token_type_embeddings: Embedding::new(token_type, h),
            layer_norm: BertLayerNorm::new(h, config.layer_norm_eps, vb.pp("LayerNorm"))?,
            dropout: Dropout::new(config.hidden_dropout_prob),
            max_positions: config.max_position_embeddings,
        })
    }

    /// `input_ids`, `token_type_ids`: `(b, t)` u32 → `(b, t, hidden)`.
    pub fn forward(&self, input_ids: &Tensor, token_type_ids: &Tensor, train: bool) -> Result<Tensor> {
        let (_b, t) = input_ids.dims2()?;
        if t > self.max_positions {
            return Err(Error::Msg(format!(
                "sequence length {t} exceeds max_position_embeddings {}",
                self.max_positions
            )));
        }
        let positions = Tensor::arange(0u32, t as u32, input_ids.device())?;
        let words = self.word_embeddings.forward(input_ids)?;
        let types = self.token_type_embeddings.forward(token_type_ids)?;
        let pos = self.position_embeddings.forward(&positions)?;
        let x = (words + types)?.broadcast_add(&pos)?;
        let x = self.layer_norm.forward(&x)?;
        self.dropout.forward(&x, train)
    }

    /// Word embedding matrix `(vocab, hidden)`, shared with the MLM decoder.
    pub fn word_embeddings(&self) -> &Tensor {
        self.word_embeddings.embeddings()
    }
}
