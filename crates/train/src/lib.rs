//! # mlm-train — data-parallel pretraining
//!
//! Masked-LM + next-sentence pretraining of [`mlm_core::BertForPreTraining`]
//! over several replicas in one process:
//!
//! * **[`Pretrainer`]** — setup (devices, vocabulary, resume point, run sizes)
//!   and the epoch loop with per-epoch checkpoints.
//! * **[`DataParallel`]** — one thread per replica, round-robin batch shards,
//!   gradient all-reduce through a [`ReplicaGroup`].
//! * **[`GroupedAdamW`]** / **[`GradAccumulator`]** — the optimizer step.
//! * **[`LrScheduler`]** — warmup → linear / cosine / constant.
//! * **[`RateTracker`]** / **[`ExecutionReport`]** — throughput reporting.

pub mod checkpoint;
pub mod metrics;
pub mod optimizer;
pub mod parallel;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{prepare_last_checkpoint, save_checkpoint, save_pretrained, ResumePoint};
pub use metrics::{ExecutionReport, RateTracker, ReplicaMetrics};
pub use optimizer::{
    clip_grad_norm, grad_norm, scale_for_accumulation, AdamWSettings, GradAccumulator,
    GroupedAdamW,
};
pub use parallel::{
    discover_devices, DataParallel, GroupAborted, Replica, ReplicaContext, ReplicaGroup,
    ReplicaLoader,
};
pub use scheduler::{LrDecay, LrScheduler};
pub use trainer::{
    train_replica, EpochSummary, LoopSettings, Pretrainer, ReplicaEpoch, ReplicaState,
    TrainerConfig, TrainingSummary,
};
