//! Data-parallel execution over several devices in one process.
//!
//! * **[`discover_devices`]** — the replica devices (CUDA ordinals, else CPU).
//! * **[`Replica`]** — one model copy bound to one device.
//! * **[`ReplicaGroup`]** — blocking all-reduce (mean) shared by the replicas.
//! * **[`DataParallel`]** — runs one closure per replica on its own thread,
//!   each seeing a round-robin shard of the epoch's batches, and keeps a
//!   per-replica [`ReplicaContext`] alive across epochs.
//!
//! Every replica takes the same number of steps, so every replica enters the
//! same sequence of all-reduces. When one replica fails the group is aborted
//! and the others return [`GroupAborted`] instead of waiting forever.

use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use mlm_common::{BertConfig, DataLoader, HostBatch};
use mlm_core::BertForPreTraining;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::optimizer::{clip_grad_norm, GroupedAdamW};

/// CUDA ordinals tried when no replica count is requested.
const MAX_CUDA_ORDINALS: usize = 16;

// ── Devices ─────────────────────────────────────────────────────────────────

/// Devices to run replicas on.
///
/// With CUDA available: `requested` ordinals, or every ordinal that opens when
/// `requested == 0`. Otherwise `max(requested, 1)` CPU replicas.
pub fn discover_devices(requested: usize, force_cpu: bool) -> Result<Vec<Device>> {
    if !force_cpu && candle_core::utils::cuda_is_available() {
        let limit = if requested == 0 {
            MAX_CUDA_ORDINALS
        } else {
            requested
        };
        let mut devices = Vec::new();
        for ordinal in 0..limit {
            match Device::new_cuda(ordinal) {
                Ok(device) => devices.push(device),
                Err(e) if requested > 0 => {
                    return Err(e).with_context(|| format!("open cuda:{ordinal}"));
                }
                Err(_) => break,
            }
        }
        if !devices.is_empty() {
            return Ok(devices);
        }
    }
    Ok(vec![Device::Cpu; requested.max(1)])
}

// ── ReplicaGroup ────────────────────────────────────────────────────────────

/// Raised by [`ReplicaGroup::all_reduce_mean`] once another replica failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("replica group aborted by a failing replica")]
pub struct GroupAborted;

#[derive(Default)]
struct ReduceState {
    generation: u64,
    arrived: usize,
    sum: Vec<Tensor>,
    result: Arc<Vec<Tensor>>,
    aborted: bool,
}

/// Rendezvous point for the replicas' gradient all-reduce.
///
/// Partial sums are kept on the host; each caller moves the mean back to its
/// own device.
pub struct ReplicaGroup {
    world_size: usize,
    state: Mutex<ReduceState>,
    cond: Condvar,
    reductions: AtomicUsize,
    wait_nanos: AtomicU64,
}

impl ReplicaGroup {
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size: world_size.max(1),
            state: Mutex::new(ReduceState::default()),
            cond: Condvar::new(),
            reductions: AtomicUsize::new(0),
            wait_nanos: AtomicU64::new(0),
        }
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Element-wise mean of `tensors` across all replicas.
    ///
    /// Blocks until every replica contributed. All callers must pass the same
    /// number of tensors with matching shapes, in the same order.
    pub fn all_reduce_mean(&self, tensors: Vec<Tensor>) -> Result<Arc<Vec<Tensor>>> {
        if self.world_size == 1 {
            return Ok(Arc::new(tensors));
        }
        let start = Instant::now();
        let host = tensors
            .iter()
            .map(|t| t.to_device(&Device::Cpu))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let mut state = self.state.lock();
        if state.aborted {
            return Err(GroupAborted.into());
        }
        let generation = state.generation;

        if let Err(e) = self.contribute(&mut state, host) {
            state.aborted = true;
            self.cond.notify_all();
            return Err(e);
        }

        if state.generation == generation {
            while state.generation == generation && !state.aborted {
                self.cond.wait(&mut state);
            }
            if state.generation == generation {
                return Err(GroupAborted.into());
            }
        }
        let result = Arc::clone(&state.result);
        drop(state);

        self.wait_nanos
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        Ok(result)
    }

    /// Add one replica's tensors; the last arrival publishes the mean.
    fn contribute(&self, state: &mut ReduceState, host: Vec<Tensor>) -> Result<()> {
        if state.arrived == 0 {
            state.sum = host;
        } else {
            anyhow::ensure!(
                state.sum.len() == host.len(),
                "all-reduce size mismatch: {} vs {} tensors",
                state.sum.len(),
                host.len()
            );
            state.sum = state
                .sum
                .iter()
                .zip(&host)
                .map(|(a, b)| a + b)
                .collect::<candle_core::Result<Vec<_>>>()?;
        }
        state.arrived += 1;

        if state.arrived == self.world_size {
            let scale = 1.0 / self.world_size as f64;
            let mean = std::mem::take(&mut state.sum)
                .iter()
                .map(|t| t.affine(scale, 0.0))
                .collect::<candle_core::Result<Vec<_>>>()?;
            state.result = Arc::new(mean);
            state.arrived = 0;
            state.generation += 1;
            self.reductions.fetch_add(1, Ordering::Relaxed);
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Release every waiting replica with [`GroupAborted`].
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// Clear an abort and any half-finished reduction. Only call while no
    /// replica is running.
    fn reset(&self) {
        let mut state = self.state.lock();
        state.aborted = false;
        state.arrived = 0;
        state.sum.clear();
    }

    /// Completed all-reduces since construction.
    pub fn reductions(&self) -> usize {
        self.reductions.load(Ordering::Relaxed)
    }

    /// Wall time spent inside `all_reduce_mean`, summed over replicas.
    pub fn wait_time(&self) -> Duration {
        Duration::from_nanos(self.wait_nanos.load(Ordering::Relaxed))
    }
}

// ── Replica ─────────────────────────────────────────────────────────────────

/// One model copy on one device.
pub struct Replica {
    rank: usize,
    device: Device,
    varmap: VarMap,
    /// Parameters sorted by name; the all-reduce order.
    named_vars: Vec<(String, Var)>,
    model: BertForPreTraining,
    group: Arc<ReplicaGroup>,
}

impl Replica {
    fn build(
        rank: usize,
        device: Device,
        config: &BertConfig,
        group: Arc<ReplicaGroup>,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = BertForPreTraining::new(vb, config)
            .with_context(|| format!("build replica {rank} on {device:?}"))?;
        let named_vars = sorted_vars(&varmap)?;
        Ok(Self {
            rank,
            device,
            varmap,
            named_vars,
            model,
            group,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model(&self) -> &BertForPreTraining {
        &self.model
    }

    pub fn named_vars(&self) -> &[(String, Var)] {
        &self.named_vars
    }

    pub fn vars(&self) -> Vec<Var> {
        self.named_vars.iter().map(|(_, v)| v.clone()).collect()
    }

    /// Mean of `tensors` across the group, moved back to this replica's device.
    pub fn all_reduce_mean(&self, tensors: Vec<Tensor>) -> Result<Vec<Tensor>> {
        let reduced = self.group.all_reduce_mean(tensors)?;
        Ok(reduced
            .iter()
            .map(|t| t.to_device(&self.device))
            .collect::<candle_core::Result<Vec<_>>>()?)
    }

    /// All-reduce `grads` across replicas, optionally clip, then step.
    ///
    /// Returns the gradient norm before clipping when `max_grad_norm > 0`.
    pub fn optimizer_step(
        &self,
        optimizer: &mut GroupedAdamW,
        mut grads: GradStore,
        max_grad_norm: f64,
    ) -> Result<Option<f64>> {
        if self.world_size() > 1 {
            let local = self
                .named_vars
                .iter()
                .map(|(_, var)| match grads.get(var.as_tensor()) {
                    Some(g) => Ok(g.clone()),
                    None => var.zeros_like(),
                })
                .collect::<candle_core::Result<Vec<_>>>()?;
            let reduced = self.all_reduce_mean(local)?;
            for ((_, var), g) in self.named_vars.iter().zip(reduced) {
                grads.insert(var.as_tensor(), g);
            }
        }

        let norm = if max_grad_norm > 0.0 {
            Some(clip_grad_norm(&mut grads, &self.vars(), max_grad_norm)?)
        } else {
            None
        };
        optimizer.step(&grads)?;
        Ok(norm)
    }

    /// Write this replica's weights as safetensors.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap
            .save(path)
            .with_context(|| format!("save weights to {}", path.display()))
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        self.varmap
            .load(path)
            .with_context(|| format!("load weights from {}", path.display()))
    }

    /// Overwrite every parameter with `source`'s value.
    fn copy_from(&self, source: &Replica) -> Result<()> {
        for ((name, dst), (src_name, src)) in self.named_vars.iter().zip(&source.named_vars) {
            anyhow::ensure!(name == src_name, "parameter mismatch: {name} vs {src_name}");
            dst.set(&src.as_tensor().to_device(&self.device)?)?;
        }
        Ok(())
    }
}

fn sorted_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

// ── Per-replica state ───────────────────────────────────────────────────────

/// State a replica keeps between [`DataParallel::run`] calls (optimizer
/// moments, schedule position).
pub struct ReplicaContext<S> {
    state: Option<S>,
}

impl<S> Default for ReplicaContext<S> {
    fn default() -> Self {
        Self { state: None }
    }
}

impl<S> ReplicaContext<S> {
    /// The stored state, created by `init` on first use.
    pub fn get_or_try_init<F>(&mut self, init: F) -> Result<&mut S>
    where
        F: FnOnce() -> Result<S>,
    {
        let state = match self.state.take() {
            Some(state) => state,
            None => init()?,
        };
        Ok(self.state.insert(state))
    }

    pub fn get(&self) -> Option<&S> {
        self.state.as_ref()
    }
}

// ── Sharded loader ──────────────────────────────────────────────────────────

/// Number of steps each replica takes over `num_batches` batches.
///
/// Trailing batches that cannot be spread over every replica are dropped.
pub fn steps_per_replica(num_batches: usize, world_size: usize) -> usize {
    num_batches / world_size.max(1)
}

/// One replica's view of an epoch: batches `rank, rank + world, …`.
pub struct ReplicaLoader<'a> {
    loader: &'a DataLoader<'a>,
    rank: usize,
    world_size: usize,
    num_steps: usize,
}

impl<'a> ReplicaLoader<'a> {
    pub fn len(&self) -> usize {
        self.num_steps
    }

    pub fn is_empty(&self) -> bool {
        self.num_steps == 0
    }

    pub fn batch_size(&self) -> usize {
        self.loader.batch_size()
    }

    /// `(step, batch)` in this replica's order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, HostBatch)> + '_ {
        (0..self.num_steps).map(move |step| {
            let index = step * self.world_size + self.rank;
            (step, self.loader.batch(index))
        })
    }
}

// ── DataParallel ────────────────────────────────────────────────────────────

/// Aborts the group unless the replica finished cleanly (including panics).
struct AbortOnFailure<'a> {
    group: &'a ReplicaGroup,
    armed: bool,
}

impl Drop for AbortOnFailure<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.group.abort();
        }
    }
}

pub struct DataParallel<S> {
    replicas: Vec<Replica>,
    contexts: Vec<ReplicaContext<S>>,
    group: Arc<ReplicaGroup>,
}

impl<S: Send> DataParallel<S> {
    /// Build one replica per device with identical weights.
    ///
    /// Replica 0 is randomly initialised, or loaded from `weights`; the others
    /// copy it.
    pub fn new(config: &BertConfig, devices: Vec<Device>, weights: Option<&Path>) -> Result<Self> {
        anyhow::ensure!(!devices.is_empty(), "need at least one device");
        let group = Arc::new(ReplicaGroup::new(devices.len()));

        let mut replicas = Vec::with_capacity(devices.len());
        for (rank, device) in devices.into_iter().enumerate() {
            replicas.push(Replica::build(rank, device, config, Arc::clone(&group))?);
        }
        if let Some(path) = weights {
            replicas[0].load(path)?;
        }
        if let Some((primary, rest)) = replicas.split_first() {
            for replica in rest {
                replica.copy_from(primary)?;
            }
        }

        tracing::debug!(
            replicas = replicas.len(),
            tensors = replicas[0].named_vars.len(),
            "replicas initialised"
        );
        let contexts = replicas.iter().map(|_| ReplicaContext::default()).collect();
        Ok(Self {
            replicas,
            contexts,
            group,
        })
    }

    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    pub fn primary(&self) -> &Replica {
        &self.replicas[0]
    }

    pub fn group(&self) -> &ReplicaGroup {
        &self.group
    }

    pub fn contexts(&self) -> &[ReplicaContext<S>] {
        &self.contexts
    }

    /// Run `f` once per replica, each on its own thread, and collect the
    /// results in rank order.
    ///
    /// On failure the first replica error is returned; errors that only
    /// report the resulting abort are skipped in favour of the cause.
    pub fn run<F, R>(&mut self, loader: &DataLoader<'_>, f: F) -> Result<Vec<R>>
    where
        F: Fn(&Replica, ReplicaLoader<'_>, &mut ReplicaContext<S>) -> Result<R> + Sync,
        R: Send,
    {
        let world_size = self.replicas.len();
        let num_steps = steps_per_replica(loader.num_batches(), world_size);
        let dropped = loader.num_batches() - num_steps * world_size;
        if dropped > 0 {
            tracing::debug!(dropped, "trailing batches not spread over all replicas");
        }
        self.group.reset();

        let f = &f;
        let group: &ReplicaGroup = &self.group;
        let outcomes: Vec<Result<R>> = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(world_size);
            for (replica, context) in self.replicas.iter().zip(self.contexts.iter_mut()) {
                let shard = ReplicaLoader {
                    loader,
                    rank: replica.rank,
                    world_size,
                    num_steps,
                };
                let spawned = std::thread::Builder::new()
                    .name(format!("replica-{}", replica.rank))
                    .spawn_scoped(scope, move || {
                        let mut guard = AbortOnFailure { group, armed: true };
                        let out = f(replica, shard, context);
                        if out.is_ok() {
                            guard.armed = false;
                        }
                        out
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        group.abort();
                        return vec![Err(anyhow::Error::new(e).context("spawn replica thread"))];
                    }
                }
            }
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(anyhow::anyhow!("replica thread panicked")))
                })
                .collect()
        });

        let mut results = Vec::with_capacity(world_size);
        let mut first_abort = None;
        for outcome in outcomes {
            match outcome {
                Ok(r) => results.push(r),
                Err(e) if e.downcast_ref::<GroupAborted>().is_some() => {
                    first_abort.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(e) = first_abort {
            return Err(e);
        }
        Ok(results)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
