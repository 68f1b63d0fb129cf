//! BERT with masked-LM and next-sentence pretraining heads.
//!
//! Parameter names follow the HuggingFace `BertForPreTraining` layout
//! (`bert.*`, `cls.predictions.*`, `cls.seq_relationship.*`), so an existing
//! `model.safetensors` loads into a freshly built [`VarMap`](candle_nn::VarMap).
//! The MLM decoder is weight-tied to the word embeddings: only
//! `cls.predictions.bias` is stored for it.

use candle_core::{IndexOp, Result, Tensor, D};
use candle_nn::{loss, ops, Init, Linear, Module, VarBuilder};

use mlm_common::{Batch, BertConfig};

use crate::activation::HiddenAct;
use crate::attention::attention_bias;
use crate::embeddings::BertEmbeddings;
use crate::encoder::BertEncoder;
use crate::linear::dense;
use crate::norm::BertLayerNorm;

// ── Encoder ─────────────────────────────────────────────────────────────────

/// Embeddings → encoder stack → pooler.
pub struct BertModel {
    embeddings: BertEmbeddings,
    encoder: BertEncoder,
    pooler: Linear,
}

impl BertModel {
    pub fn new(config: &BertConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            embeddings: BertEmbeddings::new(config, vb.pp("embeddings"))?,
            encoder: BertEncoder::new(config, vb.pp("encoder"))?,
            pooler: dense(
                config.hidden_size,
                config.hidden_size,
                config.initializer_range,
                vb.pp("pooler").pp("dense"),
            )?,
        })
    }

    /// Returns `(sequence_output (b, t, h), pooled_output (b, h))`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        token_type_ids: &Tensor,
        input_mask: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let bias = attention_bias(input_mask)?;
        let x = self.embeddings.forward(input_ids, token_type_ids, train)?;
        let sequence = self.encoder.forward(&x, &bias, train)?;
        let first = sequence.i((.., 0))?;
        let pooled = self.pooler.forward(&first)?.tanh()?;
        Ok((sequence, pooled))
    }
}

// ── Pretraining heads ───────────────────────────────────────────────────────

/// `cls.predictions`: transform (dense → act → LayerNorm) then the tied decoder.
struct LmPredictionHead {
    dense: Linear,
    act: HiddenAct,
    layer_norm: BertLayerNorm,
    bias: Tensor,
}

impl LmPredictionHead {
    fn new(config: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let transform = vb.pp("transform");
        Ok(Self {
            dense: dense(
                config.hidden_size,
                config.hidden_size,
                config.initializer_range,
                transform.pp("dense"),
            )?,
            act: HiddenAct::from_name(&config.hidden_act)?,
            layer_norm: BertLayerNorm::new(
                config.hidden_size,
                config.layer_norm_eps,
                transform.pp("LayerNorm"),
            )?,
            bias: vb.get_with_hints(config.vocab_size, "bias", Init::Const(0.))?,
        })
    }

    fn forward(&self, sequence: &Tensor, word_embeddings: &Tensor) -> Result<Tensor> {
        let (b, t, h) = sequence.dims3()?;
        let x = self.act.apply(&self.dense.forward(sequence)?)?;
        let x = self.layer_norm.forward(&x)?;
        let logits = x
            .reshape((b * t, h))?
            .matmul(&word_embeddings.t()?)?
            .broadcast_add(&self.bias)?;
        let v = logits.dim(1)?;
        logits.reshape((b, t, v))
    }
}

/// Raw scores of both pretraining heads.
pub struct PretrainingOutput {
    /// Masked-LM logits `(b, t, vocab)`.
    pub prediction_scores: Tensor,
    /// Next-sentence logits `(b, 2)`; class 1 means "random next".
    pub seq_relationship_scores: Tensor,
}

/// BERT encoder plus masked-LM and next-sentence heads.
pub struct BertForPreTraining {
    bert: BertModel,
    predictions: LmPredictionHead,
    seq_relationship: Linear,
    config: BertConfig,
}

impl BertForPreTraining {
    pub fn new(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let cls = vb.pp("cls");
        Ok(Self {
            bert: BertModel::new(config, vb.pp("bert"))?,
            predictions: LmPredictionHead::new(config, cls.pp("predictions"))?,
            seq_relationship: dense(
                config.hidden_size,
                2,
                config.initializer_range,
                cls.pp("seq_relationship"),
            )?,
            config: config.clone(),
        })
    }

    pub fn forward(
        &self,
        input_ids: &Tensor,
        token_type_ids: &Tensor,
        input_mask: &Tensor,
        train: bool,
    ) -> Result<PretrainingOutput> {
        let (sequence, pooled) = self
            .bert
            .forward(input_ids, token_type_ids, input_mask, train)?;
        let prediction_scores = self
            .predictions
            .forward(&sequence, self.bert.embeddings.word_embeddings())?;
        let seq_relationship_scores = self.seq_relationship.forward(&pooled)?;
        Ok(PretrainingOutput {
            prediction_scores,
            seq_relationship_scores,
        })
    }

    /// Forward a collated batch.
    pub fn forward_batch(&self, batch: &Batch, train: bool) -> Result<PretrainingOutput> {
        self.forward(&batch.input_ids, &batch.segment_ids, &batch.input_mask, train)
    }

    pub fn config(&self) -> &BertConfig {
        &self.config
    }
}

// ── Loss ────────────────────────────────────────────────────────────────────

/// Cross-entropy over labelled positions only.
///
/// `logits`: `(n, vocab)`, `labels`: `(n,)` u32, `mask`: `(n,)` f32 with 1.0
/// where the label counts. Averages over labelled positions; a batch with no
/// labelled position contributes zero.
pub fn masked_lm_loss(logits: &Tensor, labels: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let log_probs = ops::log_softmax(logits, D::Minus1)?;
    let picked = log_probs.gather(&labels.unsqueeze(1)?, 1)?.squeeze(1)?;
    let count = mask.sum_all()?.to_scalar::<f32>()?.max(1.0);
    (picked * mask)?.sum_all()?.affine(-1.0 / count as f64, 0.0)
}

/// Masked-LM loss plus next-sentence loss.
pub fn pretraining_loss(output: &PretrainingOutput, batch: &Batch) -> Result<Tensor> {
    let (b, t, v) = output.prediction_scores.dims3()?;
    let logits = output.prediction_scores.reshape((b * t, v))?;
    let mlm = masked_lm_loss(&logits, &batch.lm_labels, &batch.lm_label_mask)?;
    let nsp = loss::cross_entropy(&output.seq_relationship_scores, &batch.is_next)?;
    mlm + nsp
}

// ── Parameter count ─────────────────────────────────────────────────────────

/// Number of trainable scalars in [`BertForPreTraining`], from config alone.
pub fn parameter_count(config: &BertConfig) -> usize {
    let h = config.hidden_size;
    let i = config.intermediate_size;
    let v = config.vocab_size;
    let norm = 2 * h;
    let linear = |inp: usize, out: usize| inp * out + out;

    let embeddings = (v + config.max_position_embeddings + config.type_vocab_size) * h + norm;
    let per_layer = 3 * linear(h, h) // query, key, value
        + linear(h, h) + norm // attention output
        + linear(h, i) // intermediate
        + linear(i, h) + norm; // output
    let pooler = linear(h, h);
    let heads = linear(h, h) + norm + v + linear(h, 2);

    embeddings + config.num_hidden_layers * per_layer + pooler + heads
}

// ── Tests ───────────────────────────────────────────────────────────────────
