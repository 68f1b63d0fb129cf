//! # mlm-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`BertConfig`]** — model hyper-parameters (HuggingFace `config.json` layout).
//! * **[`ConfigError`]** / **[`resolve_warmup`]** — up-front run validation.
//! * **[`Vocab`]** — word piece → id lookup for pregenerated shards.
//! * **[`PregeneratedDataset`]** / **[`DataLoader`]** — shard loading, sampling and batching.
//! * **[`dataset_stats`]** — data epochs and optimizer-step arithmetic.

pub mod config;
pub mod data;
pub mod vocab;

pub use config::{resolve_warmup, BertConfig, ConfigError};
pub use data::{
    dataset_stats, Batch, DataLoader, DatasetStats, HostBatch, InputFeatures,
    PregeneratedDataset, RandomSampler, IGNORE_LABEL,
};
pub use vocab::Vocab;
