//! Model configuration and run-level validation.
//!
//! [`BertConfig`] is serialised in the HuggingFace `config.json` layout so a
//! directory produced by `save_pretrained` elsewhere can be loaded directly.
//! Every field has a bert-base default; a minimal `{}` JSON produces a
//! bert-base-uncased shaped model.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────────────

/// Configuration problems detected before any training work starts.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("warmup must be given either as --warmup-steps or as --warmup-proportion")]
    WarmupUnspecified,
    #[error("warmup given both as steps ({steps}) and as proportion ({proportion}); pick one")]
    WarmupAmbiguous { steps: usize, proportion: f64 },
    #[error("warmup proportion must be in [0, 1), got {0}")]
    WarmupProportionOutOfRange(f64),
    #[error("hidden_size ({hidden}) must be divisible by num_attention_heads ({heads})")]
    HeadsDoNotDivideHidden { hidden: usize, heads: usize },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("unsupported hidden_act {0:?} (expected gelu, gelu_new or relu)")]
    UnknownActivation(String),
}

// ── BertConfig ──────────────────────────────────────────────────────────────

/// Hyper-parameters of a BERT encoder with pretraining heads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BertConfig {
    /// Vocabulary size (must match the vocabulary file).
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_num_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    /// `gelu` (erf), `gelu_new` (tanh approximation) or `relu`.
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_dropout")]
    pub hidden_dropout_prob: f32,
    #[serde(default = "default_dropout")]
    pub attention_probs_dropout_prob: f32,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    /// Standard deviation of the normal initialiser for weight matrices.
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_vocab_size() -> usize {
    30522
}
fn default_hidden_size() -> usize {
    768
}
fn default_num_layers() -> usize {
    12
}
fn default_num_heads() -> usize {
    12
}
fn default_intermediate_size() -> usize {
    3072
}
fn default_hidden_act() -> String {
    "gelu".to_string()
}
fn default_dropout() -> f32 {
    0.1
}
fn default_max_position_embeddings() -> usize {
    512
}
fn default_type_vocab_size() -> usize {
    2
}
fn default_initializer_range() -> f64 {
    0.02
}
fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl Default for BertConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            num_hidden_layers: default_num_layers(),
            num_attention_heads: default_num_heads(),
            intermediate_size: default_intermediate_size(),
            hidden_act: default_hidden_act(),
            hidden_dropout_prob: default_dropout(),
            attention_probs_dropout_prob: default_dropout(),
            max_position_embeddings: default_max_position_embeddings(),
            type_vocab_size: default_type_vocab_size(),
            initializer_range: default_initializer_range(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

impl BertConfig {
    /// Head dimension (`hidden_size / num_attention_heads`).
    ///
    /// Only meaningful after [`validate`](Self::validate) succeeded.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads.max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("num_attention_heads", self.num_attention_heads),
            ("intermediate_size", self.intermediate_size),
            ("max_position_embeddings", self.max_position_embeddings),
            ("type_vocab_size", self.type_vocab_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(ConfigError::HeadsDoNotDivideHidden {
                hidden: self.hidden_size,
                heads: self.num_attention_heads,
            });
        }
        if !matches!(self.hidden_act.as_str(), "gelu" | "gelu_new" | "relu") {
            return Err(ConfigError::UnknownActivation(self.hidden_act.clone()));
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read model config {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("parse model config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }
}

// ── Warmup ──────────────────────────────────────────────────────────────────

/// Turn the user's warmup choice into a concrete number of optimizer steps.
///
/// Exactly one of `warmup_steps` / `warmup_proportion` must be given.
pub fn resolve_warmup(
    warmup_steps: Option<usize>,
    warmup_proportion: Option<f64>,
    total_steps: usize,
) -> Result<usize, ConfigError> {
    match (warmup_steps, warmup_proportion) {
        (Some(steps), None) => Ok(steps),
        (None, Some(p)) => {
            if !(0.0..1.0).contains(&p) {
                return Err(ConfigError::WarmupProportionOutOfRange(p));
            }
            Ok((p * total_steps as f64).floor() as usize)
        }
        (None, None) => Err(ConfigError::WarmupUnspecified),
        (Some(steps), Some(proportion)) => Err(ConfigError::WarmupAmbiguous { steps, proportion }),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
