//! End-to-end pretraining on CPU replicas with a tiny model.

use std::path::Path;

use anyhow::Result;
use candle_core::Device;
use mlm_common::{BertConfig, DataLoader, PregeneratedDataset, RandomSampler, Vocab};
use mlm_core::pretraining_loss;
use mlm_train::{
    train_replica, DataParallel, GroupAborted, LoopSettings, LrDecay, Pretrainer, ReplicaState,
    TrainerConfig,
};

const TOKENS: [&str; 12] = [
    "[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]", "the", "cat", "sat", "on", "mat", "dog", "ran",
];
const SEQ_LEN: usize = 8;

fn tiny_config() -> BertConfig {
    BertConfig {
        vocab_size: TOKENS.len(),
        hidden_size: 16,
        num_hidden_layers: 2,
        num_attention_heads: 2,
        intermediate_size: 32,
        max_position_embeddings: SEQ_LEN,
        ..Default::default()
    }
}

fn write_model_dir(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("vocab.txt"), TOKENS.join("\n") + "\n").unwrap();
    tiny_config().save(&dir.join("config.json")).unwrap();
}

fn write_shard(dir: &Path, data_epoch: usize, n: usize) {
    write_shard_with_len(dir, data_epoch, n, SEQ_LEN);
}

fn write_shard_with_len(dir: &Path, data_epoch: usize, n: usize, seq_len: usize) {
    std::fs::create_dir_all(dir).unwrap();
    let words = ["the", "cat", "sat", "on", "mat", "dog", "ran"];
    let mut text = String::new();
    for i in 0..n {
        let a = words[i % words.len()];
        let b = words[(i + 3) % words.len()];
        let line = serde_json::json!({
            "tokens": ["[CLS]", a, "[MASK]", "[SEP]", b, "[MASK]", "[SEP]"],
            "segment_ids": [0, 0, 0, 0, 1, 1, 1],
            "is_random_next": i % 2 == 0,
            "masked_lm_positions": [2, 5],
            "masked_lm_labels": [words[(i + 1) % words.len()], words[(i + 4) % words.len()]],
        });
        text.push_str(&line.to_string());
        text.push('\n');
    }
    std::fs::write(dir.join(format!("epoch_{data_epoch}.json")), text).unwrap();
    std::fs::write(
        dir.join(format!("epoch_{data_epoch}_metrics.json")),
        format!(r#"{{"num_training_examples": {n}, "max_seq_len": {seq_len}}}"#),
    )
    .unwrap();
}

fn trainer_config(root: &Path, model_dir: &Path, epochs: usize) -> TrainerConfig {
    TrainerConfig {
        bert_model: model_dir.to_path_buf(),
        pregenerated_data: root.join("data"),
        output_dir: root.join("out"),
        epochs,
        train_batch_size: 2,
        gradient_accumulation_steps: 2,
        learning_rate: 1e-3,
        warmup_proportion: Some(0.1),
        lr_decay: LrDecay::Linear,
        num_replicas: 2,
        force_cpu: true,
        show_progress: false,
        ..Default::default()
    }
}

fn max_abs_diff(a: &candle_core::Tensor, b: &candle_core::Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
        .into_iter()
        .fold(0.0, f32::max)
}

#[test]
fn two_replicas_train_checkpoint_and_resume() {
    let root = tempfile::tempdir().unwrap();
    let model_dir = root.path().join("model");
    write_model_dir(&model_dir);
    write_shard(&root.path().join("data"), 0, 12);

    let mut trainer = Pretrainer::new(trainer_config(root.path(), &model_dir, 2)).unwrap();
    assert_eq!(trainer.num_replicas(), 2);
    assert_eq!(trainer.start_epoch(), 0);
    // 2 epochs × 12 examples / batch 2 / accum 2 / 2 replicas
    assert_eq!(trainer.stats().num_train_optimization_steps, 3);
    assert_eq!(trainer.stats().num_data_epochs, 1);
    assert_eq!(trainer.warmup_steps(), 0);

    let before: Vec<_> = trainer
        .parallel()
        .primary()
        .named_vars()
        .iter()
        .map(|(_, v)| v.as_tensor().copy().unwrap())
        .collect();

    let summary = trainer.run().unwrap();
    assert_eq!(summary.epochs.len(), 2);
    for epoch in &summary.epochs {
        let loss = epoch.average_loss.expect("every replica took steps");
        assert!(loss.is_finite() && loss > 0.0, "loss {loss}");
        assert!(epoch.checkpoint.is_file());
    }

    // 6 batches per epoch → 3 micro-steps per replica; with accumulation 2
    // that is one step in epoch 0 and two in epoch 1 (carried micro-step).
    let report = &summary.report;
    assert_eq!(report.replicas.len(), 2);
    for r in &report.replicas {
        assert_eq!(r.steps, 6);
        assert_eq!(r.optimizer_steps, 3);
        assert_eq!(r.samples, 12);
    }
    assert_eq!(report.all_reduces, 3);

    let out = root.path().join("out");
    for name in [
        "config.json",
        "model.safetensors",
        "vocab.txt",
        "tokenizer_config.json",
        "checkpoint-epoch-0.safetensors",
        "checkpoint-epoch-1.safetensors",
    ] {
        assert!(out.join(name).is_file(), "missing {name}");
    }

    let replicas = trainer.parallel().replicas();
    let mut moved = false;
    for (i, ((name, a), (_, b))) in replicas[0]
        .named_vars()
        .iter()
        .zip(replicas[1].named_vars())
        .enumerate()
    {
        assert_eq!(max_abs_diff(a.as_tensor(), b.as_tensor()), 0.0, "{name} diverged");
        moved |= max_abs_diff(a.as_tensor(), &before[i]) > 0.0;
    }
    assert!(moved, "training did not change any weight");

    // Resuming from the output directory picks up after the last checkpoint.
    let mut resumed = Pretrainer::new(TrainerConfig {
        output_dir: root.path().join("out2"),
        ..trainer_config(root.path(), &out, 3)
    })
    .unwrap();
    assert_eq!(resumed.start_epoch(), 2);
    let summary = resumed.run().unwrap();
    assert_eq!(summary.start_epoch, 2);
    assert_eq!(summary.epochs.len(), 1);
    assert_eq!(summary.epochs[0].epoch, 2);
    assert!(root.path().join("out2/checkpoint-epoch-2.safetensors").is_file());
}

#[test]
fn single_replica_flag_keeps_one_device() {
    let root = tempfile::tempdir().unwrap();
    let model_dir = root.path().join("model");
    write_model_dir(&model_dir);
    write_shard(&root.path().join("data"), 0, 4);

    let mut trainer = Pretrainer::new(TrainerConfig {
        single_replica: true,
        gradient_accumulation_steps: 1,
        ..trainer_config(root.path(), &model_dir, 1)
    })
    .unwrap();
    assert_eq!(trainer.num_replicas(), 1);
    let summary = trainer.run().unwrap();
    assert_eq!(summary.report.replicas[0].optimizer_steps, 2);
    assert_eq!(summary.report.all_reduces, 0);
}

#[test]
fn missing_warmup_fails_before_training() {
    let root = tempfile::tempdir().unwrap();
    let model_dir = root.path().join("model");
    write_model_dir(&model_dir);
    write_shard(&root.path().join("data"), 0, 4);

    let err = Pretrainer::new(TrainerConfig {
        warmup_proportion: None,
        ..trainer_config(root.path(), &model_dir, 1)
    })
    .err()
    .expect("warmup is required");
    assert!(err.to_string().contains("warmup"), "{err}");
}

#[test]
fn failing_replica_does_not_hang_its_peers() {
    let root = tempfile::tempdir().unwrap();
    write_shard(&root.path().join("data"), 0, 8);
    let vocab = Vocab::from_tokens(TOKENS, true).unwrap();
    let dataset = PregeneratedDataset::load(0, &root.path().join("data"), &vocab, 1, false).unwrap();
    let loader = DataLoader::new(&dataset, RandomSampler::new(dataset.len(), 0), 2);

    let mut dp =
        DataParallel::<()>::new(&tiny_config(), vec![Device::Cpu; 3], None).unwrap();
    let err = dp
        .run(&loader, |replica, shard, _ctx| -> Result<usize> {
            if replica.rank() == 1 {
                anyhow::bail!("replica one failed");
            }
            let t = candle_core::Tensor::new(&[1f32], replica.device())?;
            replica.all_reduce_mean(vec![t])?;
            Ok(shard.len())
        })
        .unwrap_err();
    assert!(err.downcast_ref::<GroupAborted>().is_none());
    assert!(err.to_string().contains("replica one failed"), "{err}");

    // The group recovers for the next run.
    let steps = dp
        .run(&loader, |replica, shard, _ctx| -> Result<usize> {
            let t = candle_core::Tensor::new(&[replica.rank() as f32], replica.device())?;
            let mean = replica.all_reduce_mean(vec![t])?;
            assert_eq!(mean[0].to_vec1::<f32>()?, vec![1.0]);
            Ok(shard.len())
        })
        .unwrap();
    // 4 batches over 3 replicas: one step each, one batch dropped.
    assert_eq!(steps, vec![1, 1, 1]);
}

#[test]
fn sequences_longer_than_positions_fail_at_setup() {
    let root = tempfile::tempdir().unwrap();
    let model_dir = root.path().join("model");
    write_model_dir(&model_dir);
    write_shard_with_len(&root.path().join("data"), 0, 4, SEQ_LEN * 2);

    let err = Pretrainer::new(trainer_config(root.path(), &model_dir, 1))
        .err()
        .expect("shard is longer than the position table");
    assert!(err.to_string().contains("positions"), "{err}");
    assert!(!root.path().join("out/model.safetensors").exists());
}

#[test]
fn duplicate_vocab_lines_count_toward_embedding_size() {
    let root = tempfile::tempdir().unwrap();
    let model_dir = root.path().join("model");
    write_model_dir(&model_dir);
    write_shard(&root.path().join("data"), 0, 4);
    // One repeated line: 13 id slots for a 12-row embedding table.
    let mut lines = TOKENS.to_vec();
    lines.insert(6, "cat");
    std::fs::write(model_dir.join("vocab.txt"), lines.join("\n") + "\n").unwrap();

    let err = Pretrainer::new(trainer_config(root.path(), &model_dir, 1))
        .err()
        .expect("vocabulary ids exceed the embedding table");
    assert!(err.to_string().contains("id slots"), "{err}");
}

#[test]
fn accumulated_gradient_is_the_mean_of_micro_batches() {
    let root = tempfile::tempdir().unwrap();
    write_shard(&root.path().join("data"), 0, 2);
    let vocab = Vocab::from_tokens(TOKENS, true).unwrap();
    let dataset = PregeneratedDataset::load(0, &root.path().join("data"), &vocab, 1, false).unwrap();
    let loader = DataLoader::new(&dataset, RandomSampler::new(dataset.len(), 7), 1);

    // No dropout so the reference forward passes see the same activations.
    let config = BertConfig {
        hidden_dropout_prob: 0.0,
        attention_probs_dropout_prob: 0.0,
        ..tiny_config()
    };
    let mut dp = DataParallel::<ReplicaState>::new(&config, vec![Device::Cpu], None).unwrap();

    // Three-step accumulation over two micro-batches: no optimizer step yet,
    // so the weights stay put and the accumulator can be inspected.
    let accumulation_steps = 3;
    let settings = LoopSettings {
        epoch: 0,
        learning_rate: 1e-3,
        adam_epsilon: 1e-8,
        weight_decay: 0.01,
        warmup_steps: 0,
        total_steps: 10,
        lr_decay: LrDecay::Linear,
        accumulation_steps,
        max_grad_norm: 0.0,
        progress_steps: 2,
        show_progress: false,
    };
    let results = dp
        .run(&loader, |replica, shard, ctx| {
            train_replica(replica, shard, ctx, &settings)
        })
        .unwrap();
    assert_eq!(results[0].metrics.steps, 2);
    assert_eq!(results[0].metrics.optimizer_steps, 0);

    let replica = dp.primary();
    let mut per_batch = Vec::new();
    for i in 0..loader.num_batches() {
        let batch = loader.batch(i).to_device(replica.device()).unwrap();
        let output = replica.model().forward_batch(&batch, true).unwrap();
        per_batch.push(pretraining_loss(&output, &batch).unwrap().backward().unwrap());
    }

    let state = dp.contexts()[0].get().expect("replica state was created");
    assert_eq!(state.accumulator.micro_steps(), 2);
    for (name, var) in replica.named_vars() {
        let (Some(g0), Some(g1)) = (
            per_batch[0].get(var.as_tensor()),
            per_batch[1].get(var.as_tensor()),
        ) else {
            assert!(state.accumulator.accumulated(var).is_none(), "{name}");
            continue;
        };
        let expected = (g0 + g1)
            .unwrap()
            .affine(1.0 / accumulation_steps as f64, 0.0)
            .unwrap();
        let got = state.accumulator.accumulated(var).unwrap();
        let scale = max_abs_diff(&expected, &expected.zeros_like().unwrap()).max(1e-6);
        assert!(
            max_abs_diff(got, &expected) <= 1e-4 * scale,
            "{name}: accumulated gradient is not the scaled sum"
        );
    }
}
