//! # mlm-core — BERT on candle
//!
//! The encoder and pretraining heads trained by `mlm-train`:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`linear`] | Dense layers and embedding tables with BERT initialisation |
//! | [`norm`] | `BertLayerNorm` (differentiable LayerNorm) |
//! | [`activation`] | `HiddenAct` (`gelu`, `gelu_new`, `relu`) |
//! | [`embeddings`] | Word + position + token-type embeddings |
//! | [`attention`] | Bidirectional multi-head self-attention, padding bias |
//! | [`encoder`] | Post-norm transformer layers |
//! | [`model`] | `BertForPreTraining`, pretraining loss, parameter count |
//!
//! Everything runs through `candle-core`/`candle-nn` and compiles to CPU or
//! CUDA (`--features cuda`).

pub mod activation;
pub mod attention;
pub mod embeddings;
pub mod encoder;
pub mod linear;
pub mod model;
pub mod norm;

pub use model::{
    masked_lm_loss, parameter_count, pretraining_loss, BertForPreTraining, BertModel,
    PretrainingOutput,
};
