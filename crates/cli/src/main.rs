use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use mlm_common::dataset_stats;
use mlm_train::{discover_devices, LrDecay, Pretrainer, TrainerConfig};

#[derive(Parser, Debug)]
#[command(
    name = "mlm-pretrain",
    about = "Data-parallel BERT masked-LM pretraining on pregenerated data"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pretrain (or continue pretraining) a model on pregenerated epochs.
    Pretrain(PretrainArgs),
    /// Print dataset sizes and optimizer-step counts as JSON.
    Stats(StatsArgs),
}

// ── Pretrain ───────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct PretrainArgs {
    /// Directory of pregenerated `epoch_{i}.json` shards.
    #[arg(long)]
    pregenerated_data: PathBuf,
    #[arg(long)]
    output_dir: PathBuf,
    /// Model directory with config.json, vocab.txt / tokenizer.json and
    /// optional weights or epoch checkpoints.
    #[arg(long)]
    bert_model: PathBuf,
    #[arg(long)]
    do_lower_case: bool,
    /// Memory-map converted features instead of keeping them in RAM.
    #[arg(long)]
    reduce_memory: bool,
    #[arg(long, default_value = "3")]
    epochs: usize,
    /// Examples per micro-batch on each replica.
    #[arg(long, default_value = "32")]
    train_batch_size: usize,
    #[arg(long, default_value = "1")]
    gradient_accumulation_steps: usize,
    #[arg(long, default_value = "3e-5")]
    learning_rate: f64,
    #[arg(long, default_value = "1e-8")]
    adam_epsilon: f64,
    #[arg(long, default_value = "0.01")]
    weight_decay: f64,
    /// Linear warmup length in optimizer steps.
    #[arg(long, conflicts_with = "warmup_proportion")]
    warmup_steps: Option<usize>,
    /// Linear warmup as a fraction of all optimizer steps, in [0, 1).
    #[arg(long)]
    warmup_proportion: Option<f64>,
    #[arg(long, default_value = "linear", value_parser = ["linear", "cosine", "none"])]
    lr_decay: String,
    /// Gradient-norm clip; 0 disables clipping.
    #[arg(long, default_value = "1.0")]
    max_grad_norm: f64,
    /// Shuffle seed; also seeds CUDA replicas. CPU weight init and dropout
    /// are not seeded.
    #[arg(long, default_value = "42")]
    seed: u64,
    /// Replica count; 0 uses every available accelerator.
    #[arg(long, default_value = "0")]
    num_replicas: usize,
    /// Train on one replica only (debugging).
    #[arg(long)]
    single_replica: bool,
    #[arg(long)]
    cpu: bool,
    /// Log the execution report after training.
    #[arg(long)]
    metrics_report: bool,
    #[arg(long)]
    no_progress: bool,
}

fn cmd_pretrain(args: PretrainArgs) -> Result<()> {
    let config = TrainerConfig {
        bert_model: args.bert_model,
        pregenerated_data: args.pregenerated_data,
        output_dir: args.output_dir,
        epochs: args.epochs,
        train_batch_size: args.train_batch_size,
        gradient_accumulation_steps: args.gradient_accumulation_steps,
        learning_rate: args.learning_rate,
        adam_epsilon: args.adam_epsilon,
        weight_decay: args.weight_decay,
        warmup_steps: args.warmup_steps,
        warmup_proportion: args.warmup_proportion,
        lr_decay: args.lr_decay.parse::<LrDecay>()?,
        max_grad_norm: args.max_grad_norm,
        seed: args.seed,
        do_lower_case: args.do_lower_case,
        reduce_memory: args.reduce_memory,
        num_replicas: args.num_replicas,
        single_replica: args.single_replica,
        force_cpu: args.cpu,
        metrics_report: args.metrics_report,
        show_progress: !args.no_progress,
    };

    let mut trainer = Pretrainer::new(config)?;
    let summary = trainer.run()?;
    for epoch in &summary.epochs {
        tracing::info!(
            epoch = epoch.epoch,
            average_loss = epoch.average_loss.unwrap_or(f64::NAN),
            checkpoint = %epoch.checkpoint.display(),
            "epoch summary"
        );
    }
    tracing::info!(
        output_dir = %trainer.output_dir().display(),
        epochs_trained = summary.epochs.len(),
        "pretraining complete"
    );
    Ok(())
}

// ── Stats ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct StatsArgs {
    #[arg(long)]
    pregenerated_data: PathBuf,
    #[arg(long, default_value = "3")]
    epochs: usize,
    #[arg(long, default_value = "32")]
    train_batch_size: usize,
    #[arg(long, default_value = "1")]
    gradient_accumulation_steps: usize,
    /// Replica count; 0 counts the available accelerators.
    #[arg(long, default_value = "0")]
    num_replicas: usize,
    #[arg(long)]
    cpu: bool,
}

fn cmd_stats(args: StatsArgs) -> Result<()> {
    let replicas = discover_devices(args.num_replicas, args.cpu)?.len();
    let stats = dataset_stats(
        &args.pregenerated_data,
        args.epochs,
        args.train_batch_size,
        args.gradient_accumulation_steps,
        replicas,
    )?;
    let mut json = serde_json::to_value(&stats)?;
    if let Some(obj) = json.as_object_mut() {
        obj.insert("num_replicas".into(), replicas.into());
    }
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Pretrain(args) => cmd_pretrain(args),
        Command::Stats(args) => cmd_stats(args),
    }
}
