//! Pregenerated pretraining data: shard discovery, example features, sampling
//! and batching.
//!
//! A data directory holds one shard per data epoch:
//!
//! * `epoch_{i}.json` — one JSON example per line with `tokens`,
//!   `segment_ids`, `is_random_next`, `masked_lm_positions` and
//!   `masked_lm_labels` (word pieces, already masked).
//! * `epoch_{i}_metrics.json` — `num_training_examples` and `max_seq_len`.
//!
//! * **[`dataset_stats`]** — how many data epochs exist and how many optimizer
//!   steps a run will take.
//! * **[`PregeneratedDataset`]** — one shard converted to fixed-width features,
//!   held in memory or memory-mapped from a scratch directory.
//! * **[`RandomSampler`]** / **[`DataLoader`]** — shuffled [`HostBatch`]es.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use tempfile::TempDir;

use crate::vocab::Vocab;

/// Label value for positions that do not contribute to the masked-LM loss.
pub const IGNORE_LABEL: i32 = -1;

// ── Shard files ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct EpochMetrics {
    pub num_training_examples: usize,
    pub max_seq_len: usize,
}

impl EpochMetrics {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("parse {}", path.display()))
    }
}

/// One line of `epoch_{i}.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawExample {
    pub tokens: Vec<String>,
    pub segment_ids: Vec<u32>,
    pub is_random_next: bool,
    pub masked_lm_positions: Vec<usize>,
    pub masked_lm_labels: Vec<String>,
}

pub fn epoch_file(dir: &Path, data_epoch: usize) -> PathBuf {
    dir.join(format!("epoch_{data_epoch}.json"))
}

pub fn metrics_file(dir: &Path, data_epoch: usize) -> PathBuf {
    dir.join(format!("epoch_{data_epoch}_metrics.json"))
}

// ── Dataset statistics ──────────────────────────────────────────────────────

/// Sizes derived from the shard metrics before training starts.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DatasetStats {
    /// Distinct pregenerated shards that training epochs cycle over.
    pub num_data_epochs: usize,
    pub samples_per_epoch: Vec<usize>,
    /// Longest `max_seq_len` declared by any shard.
    pub max_seq_len: usize,
    pub total_train_examples: usize,
    /// Optimizer steps each replica takes over the whole run.
    pub num_train_optimization_steps: usize,
}

/// Count the available data epochs and the optimizer steps for a run of
/// `epochs` training epochs.
///
/// When fewer shards than training epochs exist, training loops over the
/// available shards.
pub fn dataset_stats(
    dir: &Path,
    epochs: usize,
    batch_size: usize,
    accumulation_steps: usize,
    num_replicas: usize,
) -> Result<DatasetStats> {
    anyhow::ensure!(batch_size > 0, "batch size must be greater than zero");
    anyhow::ensure!(
        accumulation_steps > 0,
        "gradient accumulation steps must be greater than zero"
    );
    anyhow::ensure!(num_replicas > 0, "need at least one replica");

    let mut samples_per_epoch = Vec::new();
    let mut max_seq_len = 0;
    for i in 0..epochs {
        let data = epoch_file(dir, i);
        let metrics = metrics_file(dir, i);
        if data.is_file() && metrics.is_file() {
            let metrics = EpochMetrics::load(&metrics)?;
            samples_per_epoch.push(metrics.num_training_examples);
            max_seq_len = max_seq_len.max(metrics.max_seq_len);
        } else {
            if i == 0 {
                anyhow::bail!("no training data was found in {}", dir.display());
            }
            tracing::warn!(
                data_epochs = i,
                training_epochs = epochs,
                "fewer epochs of pregenerated data than training epochs; \
                 looping over the available data reduces training diversity"
            );
            break;
        }
    }
    let num_data_epochs = samples_per_epoch.len();

    let total_train_examples: usize = if num_data_epochs == 0 {
        0
    } else {
        (0..epochs)
            .map(|i| samples_per_epoch[i % num_data_epochs])
            .sum()
    };
    let num_train_optimization_steps =
        total_train_examples / batch_size / accumulation_steps / num_replicas;

    Ok(DatasetStats {
        num_data_epochs,
        samples_per_epoch,
        max_seq_len,
        total_train_examples,
        num_train_optimization_steps,
    })
}

// ── Features ────────────────────────────────────────────────────────────────

/// Fixed-width model inputs for one example.
#[derive(Debug, Clone, PartialEq)]
pub struct InputFeatures {
    pub input_ids: Vec<u32>,
    pub input_mask: Vec<u32>,
    pub segment_ids: Vec<u32>,
    /// Target id at masked positions, [`IGNORE_LABEL`] elsewhere.
    pub lm_label_ids: Vec<i32>,
    pub is_next: u32,
}

/// Pad and id-map one raw example to `max_seq_len`.
pub fn convert_example_to_features(
    example: &RawExample,
    vocab: &Vocab,
    max_seq_len: usize,
) -> Result<InputFeatures> {
    let len = example.tokens.len();
    anyhow::ensure!(
        len == example.segment_ids.len(),
        "{} tokens but {} segment ids",
        len,
        example.segment_ids.len()
    );
    anyhow::ensure!(
        len <= max_seq_len,
        "example has {len} tokens, more than max_seq_len {max_seq_len}"
    );
    anyhow::ensure!(
        example.masked_lm_positions.len() == example.masked_lm_labels.len(),
        "{} masked positions but {} masked labels",
        example.masked_lm_positions.len(),
        example.masked_lm_labels.len()
    );

    let mut input_ids = vocab.tokens_to_ids(&example.tokens);
    input_ids.resize(max_seq_len, 0);

    let mut input_mask = vec![1u32; len];
    input_mask.resize(max_seq_len, 0);

    let mut segment_ids = example.segment_ids.clone();
    segment_ids.resize(max_seq_len, 0);

    let mut lm_label_ids = vec![IGNORE_LABEL; max_seq_len];
    let label_ids = vocab.tokens_to_ids(&example.masked_lm_labels);
    for (&pos, id) in example.masked_lm_positions.iter().zip(label_ids) {
        anyhow::ensure!(
            pos < max_seq_len,
            "masked position {pos} is outside max_seq_len {max_seq_len}"
        );
        lm_label_ids[pos] = id as i32;
    }

    Ok(InputFeatures {
        input_ids,
        input_mask,
        segment_ids,
        lm_label_ids,
        is_next: u32::from(example.is_random_next),
    })
}

// ── Feature storage ─────────────────────────────────────────────────────────

/// Column-major feature arrays, one row of `seq_len` values per example.
struct FeatureColumns {
    input_ids: Vec<u32>,
    input_mask: Vec<u32>,
    segment_ids: Vec<u32>,
    lm_label_ids: Vec<i32>,
    is_next: Vec<u32>,
}

impl FeatureColumns {
    fn with_capacity(n: usize, seq_len: usize) -> Self {
        Self {
            input_ids: Vec::with_capacity(n * seq_len),
            input_mask: Vec::with_capacity(n * seq_len),
            segment_ids: Vec::with_capacity(n * seq_len),
            lm_label_ids: Vec::with_capacity(n * seq_len),
            is_next: Vec::with_capacity(n),
        }
    }

    fn push(&mut self, f: InputFeatures) {
        self.input_ids.extend(f.input_ids);
        self.input_mask.extend(f.input_mask);
        self.segment_ids.extend(f.segment_ids);
        self.lm_label_ids.extend(f.lm_label_ids);
        self.is_next.push(f.is_next);
    }
}

/// Features spilled to scratch files and memory-mapped back.
///
/// Each column is a flat little-endian 4-byte array.
struct MmapColumns {
    input_ids: Mmap,
    input_mask: Mmap,
    segment_ids: Mmap,
    lm_label_ids: Mmap,
    is_next: Mmap,
    _scratch: TempDir,
}

/// Incrementally writes [`MmapColumns`] so the shard never sits fully in RAM.
struct MmapColumnsWriter {
    scratch: TempDir,
    input_ids: BufWriter<File>,
    input_mask: BufWriter<File>,
    segment_ids: BufWriter<File>,
    lm_label_ids: BufWriter<File>,
    is_next: BufWriter<File>,
}

const COLUMN_NAMES: [&str; 5] = [
    "input_ids",
    "input_mask",
    "segment_ids",
    "lm_label_ids",
    "is_next",
];

impl MmapColumnsWriter {
    fn new() -> Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("mlm-features-")
            .tempdir()
            .context("create feature scratch dir")?;
        let open = |name: &str| -> Result<BufWriter<File>> {
            let path = scratch.path().join(format!("{name}.bin"));
            Ok(BufWriter::new(
                File::create(&path).with_context(|| format!("create {}", path.display()))?,
            ))
        };
        Ok(Self {
            input_ids: open(COLUMN_NAMES[0])?,
            input_mask: open(COLUMN_NAMES[1])?,
            segment_ids: open(COLUMN_NAMES[2])?,
            lm_label_ids: open(COLUMN_NAMES[3])?,
            is_next: open(COLUMN_NAMES[4])?,
            scratch,
        })
    }

    fn push(&mut self, f: &InputFeatures) -> Result<()> {
        for &v in &f.input_ids {
            self.input_ids.write_all(&v.to_le_bytes())?;
        }
        for &v in &f.input_mask {
            self.input_mask.write_all(&v.to_le_bytes())?;
        }
        for &v in &f.segment_ids {
            self.segment_ids.write_all(&v.to_le_bytes())?;
        }
        for &v in &f.lm_label_ids {
            self.lm_label_ids.write_all(&v.to_le_bytes())?;
        }
        self.is_next.write_all(&f.is_next.to_le_bytes())?;
        Ok(())
    }

    fn finish(self) -> Result<MmapColumns> {
        let Self {
            scratch,
            input_ids,
            input_mask,
            segment_ids,
            lm_label_ids,
            is_next,
        } = self;
        for w in [input_ids, input_mask, segment_ids, lm_label_ids, is_next] {
            w.into_inner()
                .map_err(|e| anyhow::anyhow!("flush feature column: {}", e.error()))?
                .sync_all()?;
        }
        let map = |name: &str| -> Result<Mmap> {
            let path = scratch.path().join(format!("{name}.bin"));
            let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
            // The scratch files are private to this process and never written again.
            unsafe { Mmap::map(&file) }.with_context(|| format!("mmap {}", path.display()))
        };
        Ok(MmapColumns {
            input_ids: map(COLUMN_NAMES[0])?,
            input_mask: map(COLUMN_NAMES[1])?,
            segment_ids: map(COLUMN_NAMES[2])?,
            lm_label_ids: map(COLUMN_NAMES[3])?,
            is_next: map(COLUMN_NAMES[4])?,
            _scratch: scratch,
        })
    }
}

#[inline]
fn read_u32(bytes: &[u8], index: usize) -> u32 {
    let i = index * 4;
    u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
}

#[inline]
fn read_i32(bytes: &[u8], index: usize) -> i32 {
    let i = index * 4;
    i32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
}

enum FeatureStore {
    InMemory(FeatureColumns),
    Mmap(MmapColumns),
}

// ── PregeneratedDataset ─────────────────────────────────────────────────────

/// One pregenerated shard, converted to fixed-width features.
pub struct PregeneratedDataset {
    store: FeatureStore,
    num_samples: usize,
    seq_len: usize,
    data_epoch: usize,
}

impl PregeneratedDataset {
    /// Load the shard used by training epoch `epoch`.
    ///
    /// Epochs beyond the available data wrap around (`epoch % num_data_epochs`).
    /// With `reduce_memory`, features are written to memory-mapped scratch files.
    pub fn load(
        epoch: usize,
        dir: &Path,
        vocab: &Vocab,
        num_data_epochs: usize,
        reduce_memory: bool,
    ) -> Result<Self> {
        anyhow::ensure!(num_data_epochs > 0, "no pregenerated data epochs available");
        let data_epoch = epoch % num_data_epochs;
        let metrics = EpochMetrics::load(&metrics_file(dir, data_epoch))?;
        let num_samples = metrics.num_training_examples;
        let seq_len = metrics.max_seq_len;
        anyhow::ensure!(seq_len > 0, "max_seq_len must be greater than zero");

        let data_path = epoch_file(dir, data_epoch);
        tracing::info!(
            epoch,
            data_epoch,
            num_samples,
            seq_len,
            reduce_memory,
            path = %data_path.display(),
            "loading pregenerated shard"
        );
        let reader = BufReader::new(
            File::open(&data_path).with_context(|| format!("open {}", data_path.display()))?,
        );

        let mut examples = reader.lines().enumerate().take(num_samples).map(
            |(line_no, line)| -> Result<InputFeatures> {
                let line = line?;
                let raw: RawExample = serde_json::from_str(line.trim()).with_context(|| {
                    format!("{}: line {}", data_path.display(), line_no + 1)
                })?;
                convert_example_to_features(&raw, vocab, seq_len).with_context(|| {
                    format!("{}: line {}", data_path.display(), line_no + 1)
                })
            },
        );

        let mut seen = 0usize;
        let store = if reduce_memory {
            let mut writer = MmapColumnsWriter::new()?;
            for features in examples.by_ref() {
                writer.push(&features?)?;
                seen += 1;
            }
            FeatureStore::Mmap(writer.finish()?)
        } else {
            let mut columns = FeatureColumns::with_capacity(num_samples, seq_len);
            for features in examples.by_ref() {
                columns.push(features?);
                seen += 1;
            }
            FeatureStore::InMemory(columns)
        };
        anyhow::ensure!(
            seen == num_samples,
            "{} declares {num_samples} examples but only {seen} were found",
            data_path.display()
        );

        Ok(Self {
            store,
            num_samples,
            seq_len,
            data_epoch,
        })
    }

    pub fn len(&self) -> usize {
        self.num_samples
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Index of the shard this dataset was read from.
    pub fn data_epoch(&self) -> usize {
        self.data_epoch
    }

    pub fn is_memory_mapped(&self) -> bool {
        matches!(self.store, FeatureStore::Mmap(_))
    }

    /// Features of example `index`. Panics if out of range.
    pub fn get(&self, index: usize) -> InputFeatures {
        assert!(index < self.num_samples, "example index {index} out of range");
        let t = self.seq_len;
        let row = index * t..(index + 1) * t;
        match &self.store {
            FeatureStore::InMemory(c) => InputFeatures {
                input_ids: c.input_ids[row.clone()].to_vec(),
                input_mask: c.input_mask[row.clone()].to_vec(),
                segment_ids: c.segment_ids[row.clone()].to_vec(),
                lm_label_ids: c.lm_label_ids[row].to_vec(),
                is_next: c.is_next[index],
            },
            FeatureStore::Mmap(m) => InputFeatures {
                input_ids: row.clone().map(|i| read_u32(&m.input_ids, i)).collect(),
                input_mask: row.clone().map(|i| read_u32(&m.input_mask, i)).collect(),
                segment_ids: row.clone().map(|i| read_u32(&m.segment_ids, i)).collect(),
                lm_label_ids: row.map(|i| read_i32(&m.lm_label_ids, i)).collect(),
                is_next: read_u32(&m.is_next, index),
            },
        }
    }
}

// ── Sampling & batching ─────────────────────────────────────────────────────

/// Seeded random permutation of example indices.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    indices: Vec<usize>,
}

impl RandomSampler {
    pub fn new(num_samples: usize, seed: u64) -> Self {
        let mut indices: Vec<usize> = (0..num_samples).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        Self { indices }
    }

    pub fn num_samples(&self) -> usize {
        self.indices.len()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

/// A collated batch in host memory, ready to be moved to any replica's device.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBatch {
    pub batch_size: usize,
    pub seq_len: usize,
    pub input_ids: Vec<u32>,
    pub input_mask: Vec<u32>,
    pub segment_ids: Vec<u32>,
    pub lm_label_ids: Vec<i32>,
    pub is_next: Vec<u32>,
}

impl HostBatch {
    pub fn collate(examples: Vec<InputFeatures>, seq_len: usize) -> Self {
        let batch_size = examples.len();
        let mut columns = FeatureColumns::with_capacity(batch_size, seq_len);
        for f in examples {
            columns.push(f);
        }
        Self {
            batch_size,
            seq_len,
            input_ids: columns.input_ids,
            input_mask: columns.input_mask,
            segment_ids: columns.segment_ids,
            lm_label_ids: columns.lm_label_ids,
            is_next: columns.is_next,
        }
    }

    /// Number of positions carrying a masked-LM label.
    pub fn num_masked(&self) -> usize {
        self.lm_label_ids.iter().filter(|&&l| l != IGNORE_LABEL).count()
    }

    /// Build the candle tensors for this batch on `device`.
    pub fn to_device(&self, device: &Device) -> candle_core::Result<Batch> {
        let shape = (self.batch_size, self.seq_len);
        let flat = self.batch_size * self.seq_len;
        let mask: Vec<f32> = self.input_mask.iter().map(|&m| m as f32).collect();
        let labels: Vec<u32> = self
            .lm_label_ids
            .iter()
            .map(|&l| if l < 0 { 0 } else { l as u32 })
            .collect();
        let label_mask: Vec<f32> = self
            .lm_label_ids
            .iter()
            .map(|&l| if l < 0 { 0.0 } else { 1.0 })
            .collect();
        Ok(Batch {
            input_ids: Tensor::from_slice(&self.input_ids, shape, device)?,
            segment_ids: Tensor::from_slice(&self.segment_ids, shape, device)?,
            input_mask: Tensor::from_vec(mask, shape, device)?,
            lm_labels: Tensor::from_vec(labels, flat, device)?,
            lm_label_mask: Tensor::from_vec(label_mask, flat, device)?,
            is_next: Tensor::from_slice(&self.is_next, self.batch_size, device)?,
        })
    }
}

/// Device-resident batch.
///
/// `lm_labels` is flattened to `(b·t,)` with ignored positions clamped to 0;
/// `lm_label_mask` is 1.0 where the label counts.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Tensor,
    pub segment_ids: Tensor,
    pub input_mask: Tensor,
    pub lm_labels: Tensor,
    pub lm_label_mask: Tensor,
    pub is_next: Tensor,
}

/// Batches a dataset in sampler order; the final partial batch is kept.
pub struct DataLoader<'a> {
    dataset: &'a PregeneratedDataset,
    sampler: RandomSampler,
    batch_size: usize,
}

impl<'a> DataLoader<'a> {
    pub fn new(dataset: &'a PregeneratedDataset, sampler: RandomSampler, batch_size: usize) -> Self {
        Self {
            dataset,
            sampler,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn sampler(&self) -> &RandomSampler {
        &self.sampler
    }

    pub fn num_batches(&self) -> usize {
        self.sampler.num_samples().div_ceil(self.batch_size)
    }

    /// Collate batch `index` (in sampler order).
    pub fn batch(&self, index: usize) -> HostBatch {
        let start = index * self.batch_size;
        let end = (start + self.batch_size).min(self.sampler.num_samples());
        let examples = self.sampler.indices()[start..end]
            .iter()
            .map(|&i| self.dataset.get(i))
            .collect();
        HostBatch::collate(examples, self.dataset.seq_len())
    }

    pub fn iter(&self) -> impl Iterator<Item = HostBatch> + '_ {
        (0..self.num_batches()).map(move |i| self.batch(i))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocab {
        Vocab::from_tokens(
            ["[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]", "the", "cat", "sat", "dog"],
            true,
        )
        .unwrap()
    }

    fn raw(tokens: &[&str], positions: &[usize], labels: &[&str], random_next: bool) -> RawExample {
        let n = tokens.len();
        RawExample {
            tokens: tokens.iter().map(|s| s.to_string()).collect(),
            segment_ids: (0..n).map(|i| u32::from(i >= n / 2)).collect(),
            is_random_next: random_next,
            masked_lm_positions: positions.to_vec(),
            masked_lm_labels: labels.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn write_shard(dir: &Path, data_epoch: usize, examples: &[RawExample], declared: usize, seq_len: usize) {
        let mut text = String::new();
        for ex in examples {
            let v = serde_json::json!({
                "tokens": ex.tokens,
                "segment_ids": ex.segment_ids,
                "is_random_next": ex.is_random_next,
                "masked_lm_positions": ex.masked_lm_positions,
                "masked_lm_labels": ex.masked_lm_labels,
            });
            text.push_str(&v.to_string());
            text.push('\n');
        }
        std::fs::write(epoch_file(dir, data_epoch), text).unwrap();
        std::fs::write(
            metrics_file(dir, data_epoch),
            format!(r#"{{"num_training_examples": {declared}, "max_seq_len": {seq_len}}}"#),
        )
        .unwrap();
    }

    #[test]
    fn features_are_padded_and_labelled() {
        let ex = raw(&["[CLS]", "the", "[MASK]", "[SEP]"], &[2], &["cat"], true);
        let f = convert_example_to_features(&ex, &vocab(), 6).unwrap();
        assert_eq!(f.input_ids, vec![2, 5, 4, 3, 0, 0]);
        assert_eq!(f.input_mask, vec![1, 1, 1, 1, 0, 0]);
        assert_eq!(f.segment_ids, vec![0, 0, 1, 1, 0, 0]);
        assert_eq!(f.lm_label_ids, vec![-1, -1, 6, -1, -1, -1]);
        assert_eq!(f.is_next, 1);
    }

    #[test]
    fn unknown_label_maps_to_unk() {
        let ex = raw(&["[CLS]", "[MASK]", "[SEP]"], &[1], &["zebra"], false);
        let f = convert_example_to_features(&ex, &vocab(), 3).unwrap();
        assert_eq!(f.lm_label_ids[1], 1);
        assert_eq!(f.is_next, 0);
    }

    #[test]
    fn too_long_example_is_rejected() {
        let ex = raw(&["[CLS]", "the", "cat", "[SEP]"], &[], &[], false);
        assert!(convert_example_to_features(&ex, &vocab(), 3).is_err());
    }

    #[test]
    fn mismatched_segments_are_rejected() {
        let mut ex = raw(&["[CLS]", "the", "[SEP]"], &[], &[], false);
        ex.segment_ids.pop();
        assert!(convert_example_to_features(&ex, &vocab(), 8).is_err());
    }

    #[test]
    fn mismatched_mask_labels_are_rejected() {
        let ex = raw(&["[CLS]", "[MASK]", "[SEP]"], &[1], &[], false);
        assert!(convert_example_to_features(&ex, &vocab(), 8).is_err());
    }

    #[test]
    fn masked_position_out_of_range_is_rejected() {
        let ex = raw(&["[CLS]", "[MASK]", "[SEP]"], &[9], &["cat"], false);
        assert!(convert_example_to_features(&ex, &vocab(), 4).is_err());
    }

    #[test]
    fn stats_loop_over_available_shards() {
        let dir = tempfile::tempdir().unwrap();
        let ex = raw(&["[CLS]", "the", "[SEP]"], &[], &[], false);
        write_shard(dir.path(), 0, &vec![ex.clone(); 10], 10, 8);
        write_shard(dir.path(), 1, &vec![ex; 6], 6, 12);

        let stats = dataset_stats(dir.path(), 5, 2, 1, 1).unwrap();
        assert_eq!(stats.num_data_epochs, 2);
        assert_eq!(stats.max_seq_len, 12);
        assert_eq!(stats.samples_per_epoch, vec![10, 6]);
        // 10 + 6 + 10 + 6 + 10
        assert_eq!(stats.total_train_examples, 42);
        assert_eq!(stats.num_train_optimization_steps, 21);

        let stats = dataset_stats(dir.path(), 5, 2, 2, 4).unwrap();
        assert_eq!(stats.num_train_optimization_steps, 42 / 2 / 2 / 4);
    }

    #[test]
    fn stats_without_data_fail() {
        let dir = tempfile::tempdir().unwrap();
        assert!(dataset_stats(dir.path(), 3, 2, 1, 1).is_err());
    }

    #[test]
    fn dataset_loads_in_memory_and_mmap_identically() {
        let dir = tempfile::tempdir().unwrap();
        let examples = vec![
            raw(&["[CLS]", "the", "[MASK]", "[SEP]"], &[2], &["cat"], false),
            raw(&["[CLS]", "[MASK]", "sat", "[SEP]"], &[1], &["dog"], true),
            raw(&["[CLS]", "the", "dog", "[SEP]"], &[], &[], false),
        ];
        write_shard(dir.path(), 0, &examples, 3, 6);

        let v = vocab();
        let mem = PregeneratedDataset::load(2, dir.path(), &v, 1, false).unwrap();
        let mapped = PregeneratedDataset::load(2, dir.path(), &v, 1, true).unwrap();
        assert_eq!(mem.data_epoch(), 0);
        assert!(!mem.is_memory_mapped());
        assert!(mapped.is_memory_mapped());
        assert_eq!(mem.len(), 3);
        for i in 0..3 {
            assert_eq!(mem.get(i), mapped.get(i));
        }
        assert_eq!(mapped.get(1).lm_label_ids[1], 8);
    }

    #[test]
    fn dataset_with_missing_lines_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ex = raw(&["[CLS]", "the", "[SEP]"], &[], &[], false);
        write_shard(dir.path(), 0, &[ex], 4, 8);
        assert!(PregeneratedDataset::load(0, dir.path(), &vocab(), 1, false).is_err());
    }

    #[test]
    fn sampler_is_a_seeded_permutation() {
        let a = RandomSampler::new(50, 7);
        let b = RandomSampler::new(50, 7);
        let c = RandomSampler::new(50, 8);
        assert_eq!(a.indices(), b.indices());
        assert_ne!(a.indices(), c.indices());
        let mut sorted = a.indices().to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn loader_keeps_partial_last_batch() {
        let dir = tempfile::tempdir().unwrap();
        let ex = raw(&["[CLS]", "[MASK]", "[SEP]"], &[1], &["cat"], false);
        write_shard(dir.path(), 0, &vec![ex; 5], 5, 4);
        let ds = PregeneratedDataset::load(0, dir.path(), &vocab(), 1, false).unwrap();
        let loader = DataLoader::new(&ds, RandomSampler::new(ds.len(), 0), 2);
        let sizes: Vec<usize> = loader.iter().map(|b| b.batch_size).collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let batch = loader.batch(0);
        assert_eq!(batch.input_ids.len(), 8);
        assert_eq!(batch.num_masked(), 2);
    }

    #[test]
    fn host_batch_to_tensors() {
        let f = convert_example_to_features(
            &raw(&["[CLS]", "[MASK]", "[SEP]"], &[1], &["cat"], true),
            &vocab(),
            4,
        )
        .unwrap();
        let batch = HostBatch::collate(vec![f.clone(), f], 4)
            .to_device(&Device::Cpu)
            .unwrap();
        assert_eq!(batch.input_ids.dims(), &[2, 4]);
        assert_eq!(batch.lm_labels.dims(), &[8]);
        assert_eq!(
            batch.lm_label_mask.to_vec1::<f32>().unwrap(),
            vec![0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0]
        );
        assert_eq!(batch.lm_labels.to_vec1::<u32>().unwrap()[1], 6);
        assert_eq!(batch.is_next.to_vec1::<u32>().unwrap(), vec![1, 1]);
    }
}
