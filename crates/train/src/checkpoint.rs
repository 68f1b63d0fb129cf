//! Model directory layout, resume discovery and checkpoint writing.
//!
//! An output directory ends up with:
//!
//! * `config.json` — the [`BertConfig`].
//! * `model.safetensors` — the latest weights.
//! * `checkpoint-epoch-{N}.safetensors` — weights after training epoch `N`.
//! * `vocab.txt` / `tokenizer_config.json` — written by the vocabulary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mlm_common::BertConfig;

use crate::parallel::Replica;

pub const CONFIG_NAME: &str = "config.json";
pub const WEIGHTS_NAME: &str = "model.safetensors";

const CHECKPOINT_PREFIX: &str = "checkpoint-epoch-";
const CHECKPOINT_SUFFIX: &str = ".safetensors";

pub fn checkpoint_name(epoch: usize) -> String {
    format!("{CHECKPOINT_PREFIX}{epoch}{CHECKPOINT_SUFFIX}")
}

fn parse_checkpoint_epoch(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix(CHECKPOINT_PREFIX)?
        .strip_suffix(CHECKPOINT_SUFFIX)?
        .parse()
        .ok()
}

/// Where training resumes from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    /// Weights to load, or `None` for a random initialisation.
    pub weights: Option<PathBuf>,
    /// First training epoch to run.
    pub start_epoch: usize,
}

/// Pick the newest epoch checkpoint in `model_dir`, falling back to
/// `model.safetensors`, then to a fresh initialisation.
pub fn prepare_last_checkpoint(model_dir: &Path) -> Result<ResumePoint> {
    let entries = std::fs::read_dir(model_dir)
        .with_context(|| format!("read model directory {}", model_dir.display()))?;

    let mut latest: Option<(usize, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(epoch) = name.to_str().and_then(parse_checkpoint_epoch) else {
            continue;
        };
        if latest.as_ref().map_or(true, |(e, _)| epoch > *e) {
            latest = Some((epoch, entry.path()));
        }
    }

    if let Some((epoch, path)) = latest {
        tracing::info!(epoch, path = %path.display(), "resuming from epoch checkpoint");
        return Ok(ResumePoint {
            weights: Some(path),
            start_epoch: epoch + 1,
        });
    }

    let weights = model_dir.join(WEIGHTS_NAME);
    if weights.is_file() {
        tracing::info!(path = %weights.display(), "initialising from pretrained weights");
        return Ok(ResumePoint {
            weights: Some(weights),
            start_epoch: 0,
        });
    }

    tracing::info!(dir = %model_dir.display(), "no weights found; starting from random initialisation");
    Ok(ResumePoint {
        weights: None,
        start_epoch: 0,
    })
}

/// Write `config.json` and `model.safetensors` from `replica`.
pub fn save_pretrained(replica: &Replica, config: &BertConfig, output_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("create {}", output_dir.display()))?;
    config.save(&output_dir.join(CONFIG_NAME))?;
    let weights = output_dir.join(WEIGHTS_NAME);
    replica.save(&weights)?;
    Ok(weights)
}

/// Write the epoch checkpoint and refresh the pretrained files.
pub fn save_checkpoint(
    replica: &Replica,
    config: &BertConfig,
    epoch: usize,
    output_dir: &Path,
) -> Result<PathBuf> {
    save_pretrained(replica, config, output_dir)?;
    let path = output_dir.join(checkpoint_name(epoch));
    replica.save(&path)?;
    tracing::info!(epoch, path = %path.display(), "checkpoint saved");
    Ok(path)
}
