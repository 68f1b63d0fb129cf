//! Pretrainer: setup, the per-replica epoch loop and checkpointing.
//!
//! [`Pretrainer::new`] resolves devices, vocabulary, resume point, model and
//! run-level sizes; [`Pretrainer::run`] drives one [`DataParallel::run`] per
//! training epoch with [`train_replica`] as the per-replica body.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use mlm_common::{
    dataset_stats, resolve_warmup, BertConfig, DataLoader, DatasetStats, PregeneratedDataset,
    RandomSampler, Vocab,
};
use mlm_core::{parameter_count, pretraining_loss};

use crate::checkpoint::{prepare_last_checkpoint, save_checkpoint, save_pretrained, CONFIG_NAME};
use crate::metrics::{ExecutionReport, RateTracker, ReplicaMetrics};
use crate::optimizer::{scale_for_accumulation, AdamWSettings, GradAccumulator, GroupedAdamW};
use crate::parallel::{discover_devices, DataParallel, Replica, ReplicaContext, ReplicaLoader};
use crate::scheduler::{LrDecay, LrScheduler};

// ── Config ──────────────────────────────────────────────────────────────────

/// All run-level knobs (CLI-level).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Model directory: `config.json`, vocabulary, optional weights.
    pub bert_model: PathBuf,
    pub pregenerated_data: PathBuf,
    pub output_dir: PathBuf,

    pub epochs: usize,
    /// Examples per micro-batch on each replica.
    pub train_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub adam_epsilon: f64,
    pub weight_decay: f64,
    pub warmup_steps: Option<usize>,
    pub warmup_proportion: Option<f64>,
    pub lr_decay: LrDecay,
    /// `0` disables clipping.
    pub max_grad_norm: f64,
    /// Seeds the per-epoch shuffle and accelerator RNGs. candle cannot seed
    /// its CPU generator, so CPU initialisation and dropout stay unseeded.
    pub seed: u64,

    pub do_lower_case: bool,
    /// Memory-map the converted features instead of holding them in RAM.
    pub reduce_memory: bool,

    /// `0` means every available accelerator (or one CPU replica).
    pub num_replicas: usize,
    pub single_replica: bool,
    pub force_cpu: bool,

    pub metrics_report: bool,
    pub show_progress: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            bert_model: PathBuf::from("bert-base-uncased"),
            pregenerated_data: PathBuf::from("data"),
            output_dir: PathBuf::from("output"),
            epochs: 3,
            train_batch_size: 32,
            gradient_accumulation_steps: 1,
            learning_rate: 3e-5,
            adam_epsilon: 1e-8,
            weight_decay: 0.01,
            warmup_steps: None,
            warmup_proportion: None,
            lr_decay: LrDecay::Linear,
            max_grad_norm: 1.0,
            seed: 42,
            do_lower_case: false,
            reduce_memory: false,
            num_replicas: 0,
            single_replica: false,
            force_cpu: false,
            metrics_report: false,
            show_progress: true,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.train_batch_size > 0, "train batch size must be greater than zero");
        anyhow::ensure!(
            self.gradient_accumulation_steps > 0,
            "gradient accumulation steps must be greater than zero"
        );
        anyhow::ensure!(self.epochs > 0, "epochs must be greater than zero");
        anyhow::ensure!(self.learning_rate >= 0.0, "learning rate must not be negative");
        // Total steps are not known yet; this only checks the warmup form.
        resolve_warmup(self.warmup_steps, self.warmup_proportion, 0)?;
        Ok(())
    }
}

// ── Per-replica loop ────────────────────────────────────────────────────────

/// Optimizer-side state a replica carries from epoch to epoch.
pub struct ReplicaState {
    pub optimizer: GroupedAdamW,
    pub scheduler: LrScheduler,
    /// Micro-batches left over at an epoch end carry into the next epoch.
    pub accumulator: GradAccumulator,
}

impl ReplicaState {
    fn new(replica: &Replica, settings: &LoopSettings) -> Result<Self> {
        let optimizer = GroupedAdamW::new(
            replica.named_vars(),
            AdamWSettings {
                lr: settings.learning_rate,
                eps: settings.adam_epsilon,
                weight_decay: settings.weight_decay,
            },
        )?;
        let scheduler = LrScheduler::new(
            settings.learning_rate,
            settings.warmup_steps,
            settings.total_steps,
            settings.lr_decay,
        );
        Ok(Self {
            optimizer,
            scheduler,
            accumulator: GradAccumulator::new(replica.vars()),
        })
    }
}

/// What every replica needs to know about the epoch it is running.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub epoch: usize,
    pub learning_rate: f64,
    pub adam_epsilon: f64,
    pub weight_decay: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
    pub lr_decay: LrDecay,
    pub accumulation_steps: usize,
    pub max_grad_norm: f64,
    /// Progress-bar length on the primary replica.
    pub progress_steps: usize,
    pub show_progress: bool,
}

/// One replica's result for one epoch.
#[derive(Debug, Clone)]
pub struct ReplicaEpoch {
    /// Mean unscaled loss over the replica's steps, `None` without steps.
    pub mean_loss: Option<f64>,
    pub metrics: ReplicaMetrics,
}

fn progress_bar(len: usize, epoch: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {prefix} {bar:40} {pos}/{len} {msg}")
            .context("progress bar template")?
            .progress_chars("=>-"),
    );
    pb.set_prefix(format!("epoch {epoch}"));
    Ok(pb)
}

/// Train `replica` over its shard of one epoch.
pub fn train_replica(
    replica: &Replica,
    loader: ReplicaLoader<'_>,
    context: &mut ReplicaContext<ReplicaState>,
    settings: &LoopSettings,
) -> Result<ReplicaEpoch> {
    let state = context.get_or_try_init(|| ReplicaState::new(replica, settings))?;
    let accum = settings.accumulation_steps.max(1);
    let start = Instant::now();

    let pb = if replica.is_primary() && settings.show_progress {
        Some(progress_bar(settings.progress_steps, settings.epoch)?)
    } else {
        None
    };

    let mut tracker = RateTracker::default();
    let mut loss_sum = 0.0f64;
    let mut steps = 0usize;
    let mut optimizer_steps = 0usize;

    for (step, host) in loader.iter() {
        let batch = host
            .to_device(replica.device())
            .with_context(|| format!("replica {}: move batch {step}", replica.rank()))?;
        let output = replica.model().forward_batch(&batch, true)?;
        let loss = pretraining_loss(&output, &batch)?;
        let loss_value = loss.to_scalar::<f32>()? as f64;
        let loss = scale_for_accumulation(loss, accum)?;
        state.accumulator.add(loss.backward()?)?;
        tracker.add(host.batch_size);

        if state.accumulator.micro_steps() >= accum {
            if let Some(grads) = state.accumulator.take() {
                let lr = state.scheduler.current_lr();
                state.optimizer.set_learning_rate(lr);
                let norm = replica.optimizer_step(&mut state.optimizer, grads, settings.max_grad_norm)?;
                state.scheduler.advance();
                optimizer_steps += 1;
                tracing::debug!(
                    replica = replica.rank(),
                    step,
                    lr,
                    grad_norm = norm.unwrap_or(f64::NAN),
                    "optimizer step"
                );
            }
        }

        loss_sum += loss_value;
        steps += 1;
        if let Some(ref pb) = pb {
            pb.inc(1);
            pb.set_message(format!(
                "loss {:.4} lr {:.2e} {:.1} samples/s",
                loss_value,
                state.scheduler.current_lr(),
                tracker.rate()
            ));
        }
    }
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    let mean_loss = (steps > 0).then(|| loss_sum / steps as f64);
    tracing::debug!(
        replica = replica.rank(),
        epoch = settings.epoch,
        steps,
        optimizer_steps,
        mean_loss = mean_loss.unwrap_or(f64::NAN),
        samples_per_sec = format!("{:.1}", tracker.global_rate()),
        "replica epoch finished"
    );
    Ok(ReplicaEpoch {
        mean_loss,
        metrics: ReplicaMetrics {
            rank: replica.rank(),
            steps,
            optimizer_steps,
            samples: tracker.count(),
            seconds: start.elapsed().as_secs_f64(),
        },
    })
}

// ── Pretrainer ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Mean of the replicas' mean losses.
    pub average_loss: Option<f64>,
    pub seconds: f64,
    pub checkpoint: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub start_epoch: usize,
    pub epochs: Vec<EpochSummary>,
    pub report: ExecutionReport,
}

pub struct Pretrainer {
    config: TrainerConfig,
    model_config: BertConfig,
    vocab: Vocab,
    parallel: DataParallel<ReplicaState>,
    stats: DatasetStats,
    warmup_steps: usize,
    start_epoch: usize,
}

impl Pretrainer {
    /// Run setup: devices, vocabulary, resume point, replicas and run sizes.
    pub fn new(config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.output_dir)
            .with_context(|| format!("create output dir {}", config.output_dir.display()))?;

        let mut devices = discover_devices(config.num_replicas, config.force_cpu)?;
        if config.single_replica {
            devices.truncate(1);
        }
        for device in &devices {
            if !device.is_cpu() {
                device.set_seed(config.seed)?;
            }
        }
        tracing::info!(
            replicas = devices.len(),
            device = ?devices[0],
            "devices selected"
        );

        let vocab = Vocab::from_pretrained(&config.bert_model, config.do_lower_case)?;
        vocab.save_pretrained(&config.output_dir)?;

        let resume = prepare_last_checkpoint(&config.bert_model)?;
        let model_config = BertConfig::load(&config.bert_model.join(CONFIG_NAME))?;
        anyhow::ensure!(
            vocab.len() <= model_config.vocab_size,
            "vocabulary has {} id slots but the model only embeds {}",
            vocab.len(),
            model_config.vocab_size
        );
        tracing::info!(
            layers = model_config.num_hidden_layers,
            hidden = model_config.hidden_size,
            params = parameter_count(&model_config),
            "model config loaded"
        );

        let stats = dataset_stats(
            &config.pregenerated_data,
            config.epochs,
            config.train_batch_size,
            config.gradient_accumulation_steps,
            devices.len(),
        )?;
        anyhow::ensure!(
            stats.max_seq_len <= model_config.max_position_embeddings,
            "pregenerated sequences reach {} tokens but the model has only {} positions",
            stats.max_seq_len,
            model_config.max_position_embeddings
        );

        let parallel =
            DataParallel::new(&model_config, devices, resume.weights.as_deref())?;
        save_pretrained(parallel.primary(), &model_config, &config.output_dir)?;
        let warmup_steps = resolve_warmup(
            config.warmup_steps,
            config.warmup_proportion,
            stats.num_train_optimization_steps,
        )?;
        tracing::info!(
            data_epochs = stats.num_data_epochs,
            examples = stats.total_train_examples,
            optimization_steps = stats.num_train_optimization_steps,
            warmup_steps,
            start_epoch = resume.start_epoch,
            "run prepared"
        );

        Ok(Self {
            config,
            model_config,
            vocab,
            parallel,
            stats,
            warmup_steps,
            start_epoch: resume.start_epoch,
        })
    }

    pub fn stats(&self) -> &DatasetStats {
        &self.stats
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn num_replicas(&self) -> usize {
        self.parallel.num_replicas()
    }

    pub fn parallel(&self) -> &DataParallel<ReplicaState> {
        &self.parallel
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    fn loop_settings(&self, epoch: usize, num_samples: usize) -> LoopSettings {
        let c = &self.config;
        LoopSettings {
            epoch,
            learning_rate: c.learning_rate,
            adam_epsilon: c.adam_epsilon,
            weight_decay: c.weight_decay,
            warmup_steps: self.warmup_steps,
            total_steps: self.stats.num_train_optimization_steps,
            lr_decay: c.lr_decay,
            accumulation_steps: c.gradient_accumulation_steps,
            max_grad_norm: c.max_grad_norm,
            progress_steps: num_samples / c.train_batch_size / self.parallel.num_replicas(),
            show_progress: c.show_progress,
        }
    }

    /// Train the remaining epochs, checkpointing after each.
    pub fn run(&mut self) -> Result<TrainingSummary> {
        let mut report = ExecutionReport::default();
        let mut epochs = Vec::new();

        for epoch in self.start_epoch..self.config.epochs {
            let dataset = PregeneratedDataset::load(
                epoch,
                &self.config.pregenerated_data,
                &self.vocab,
                self.stats.num_data_epochs,
                self.config.reduce_memory,
            )?;
            let sampler = RandomSampler::new(dataset.len(), self.config.seed.wrapping_add(epoch as u64));
            let settings = self.loop_settings(epoch, sampler.num_samples());
            let loader = DataLoader::new(&dataset, sampler, self.config.train_batch_size);

            tracing::info!(
                epoch,
                data_epoch = dataset.data_epoch(),
                examples = dataset.len(),
                steps = settings.progress_steps,
                replicas = self.parallel.num_replicas(),
                "epoch started"
            );
            let started = Instant::now();
            let results = self
                .parallel
                .run(&loader, |replica, shard, context| {
                    train_replica(replica, shard, context, &settings)
                })
                .with_context(|| format!("training epoch {epoch}"))?;
            let elapsed = started.elapsed();

            let losses: Vec<f64> = results.iter().filter_map(|r| r.mean_loss).collect();
            let average_loss =
                (!losses.is_empty()).then(|| losses.iter().sum::<f64>() / losses.len() as f64);
            tracing::info!(
                epoch,
                average_loss = average_loss.unwrap_or(f64::NAN),
                seconds = format!("{:.1}", elapsed.as_secs_f64()),
                "epoch finished"
            );

            let checkpoint = save_checkpoint(
                self.parallel.primary(),
                &self.model_config,
                epoch,
                &self.config.output_dir,
            )?;
            let metrics: Vec<ReplicaMetrics> = results.into_iter().map(|r| r.metrics).collect();
            report.record_epoch(&metrics, elapsed);
            epochs.push(EpochSummary {
                epoch,
                average_loss,
                seconds: elapsed.as_secs_f64(),
                checkpoint,
            });
        }

        let group = self.parallel.group();
        report.set_all_reduce(group.reductions(), group.wait_time());
        if self.config.metrics_report {
            report.log();
        }
        Ok(TrainingSummary {
            start_epoch: self.start_epoch,
            epochs,
            report,
        })
    }
}
