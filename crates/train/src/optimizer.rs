//! Optimizer plumbing for a single replica.
//!
//! * **[`GroupedAdamW`]** — AdamW with two parameter groups: biases and
//!   LayerNorm parameters get no weight decay, everything else does.
//! * **[`GradAccumulator`]** / **[`scale_for_accumulation`]** — sums
//!   parameter gradients over loss-scaled micro-batches before an optimizer
//!   step.
//! * **[`clip_grad_norm`]** / **[`grad_norm`]** — global L2 norm handling.

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

/// Name fragments that put a parameter in the no-decay group.
pub const NO_DECAY: [&str; 3] = ["bias", "LayerNorm.bias", "LayerNorm.weight"];

pub fn is_no_decay(name: &str) -> bool {
    NO_DECAY.iter().any(|nd| name.contains(nd))
}

// ── GroupedAdamW ────────────────────────────────────────────────────────────

/// Hyper-parameters shared by both groups.
#[derive(Clone, Copy, Debug)]
pub struct AdamWSettings {
    pub lr: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWSettings {
    fn default() -> Self {
        Self {
            lr: 3e-5,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

pub struct GroupedAdamW {
    decay: AdamW,
    no_decay: AdamW,
    num_decay: usize,
    num_no_decay: usize,
}

impl GroupedAdamW {
    pub fn new(named_vars: &[(String, Var)], settings: AdamWSettings) -> Result<Self> {
        let (no_decay, decay): (Vec<_>, Vec<_>) =
            named_vars.iter().partition(|(name, _)| is_no_decay(name));
        let num_decay = decay.len();
        let num_no_decay = no_decay.len();

        let params = |weight_decay| ParamsAdamW {
            lr: settings.lr,
            eps: settings.eps,
            weight_decay,
            ..Default::default()
        };
        Ok(Self {
            decay: AdamW::new(
                decay.into_iter().map(|(_, v)| v.clone()).collect(),
                params(settings.weight_decay),
            )?,
            no_decay: AdamW::new(
                no_decay.into_iter().map(|(_, v)| v.clone()).collect(),
                params(0.0),
            )?,
            num_decay,
            num_no_decay,
        })
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.decay.step(grads)?;
        self.no_decay.step(grads)
    }

    pub fn learning_rate(&self) -> f64 {
        self.decay.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.decay.set_learning_rate(lr);
        self.no_decay.set_learning_rate(lr);
    }

    /// `(decayed, not decayed)` parameter tensor counts.
    pub fn group_sizes(&self) -> (usize, usize) {
        (self.num_decay, self.num_no_decay)
    }
}

// ── Gradient accumulation ───────────────────────────────────────────────────

/// Running sum of parameter gradients across micro-batches.
///
/// Only the parameter gradients are kept between micro-batches; the store of
/// the latest backward pass carries them into the optimizer.
pub struct GradAccumulator {
    vars: Vec<Var>,
    sums: Vec<Option<Tensor>>,
    carrier: Option<GradStore>,
    micro_steps: usize,
}

impl GradAccumulator {
    pub fn new(vars: Vec<Var>) -> Self {
        let sums = vec![None; vars.len()];
        Self {
            vars,
            sums,
            carrier: None,
            micro_steps: 0,
        }
    }

    pub fn add(&mut self, mut grads: GradStore) -> Result<()> {
        for (var, sum) in self.vars.iter().zip(self.sums.iter_mut()) {
            if let Some(g) = grads.remove(var.as_tensor()) {
                *sum = Some(match sum.take() {
                    Some(acc) => (acc + g)?,
                    None => g,
                });
            }
        }
        self.carrier = Some(grads);
        self.micro_steps += 1;
        Ok(())
    }

    pub fn micro_steps(&self) -> usize {
        self.micro_steps
    }

    /// Gradient summed so far for `var`.
    pub fn accumulated(&self, var: &Var) -> Option<&Tensor> {
        let id = var.as_tensor().id();
        self.vars
            .iter()
            .position(|v| v.as_tensor().id() == id)
            .and_then(|i| self.sums[i].as_ref())
    }

    /// Hand out the summed gradients and reset.
    pub fn take(&mut self) -> Option<GradStore> {
        let mut grads = self.carrier.take()?;
        for (var, sum) in self.vars.iter().zip(self.sums.iter_mut()) {
            if let Some(g) = sum.take() {
                grads.insert(var.as_tensor(), g);
            }
        }
        self.micro_steps = 0;
        Some(grads)
    }
}

/// Scale a micro-batch loss so that gradients summed over
/// `accumulation_steps` micro-batches average them.
pub fn scale_for_accumulation(loss: Tensor, accumulation_steps: usize) -> Result<Tensor> {
    if accumulation_steps > 1 {
        loss.affine(1.0 / accumulation_steps as f64, 0.0)
    } else {
        Ok(loss)
    }
}

// ── Gradient norm ───────────────────────────────────────────────────────────

/// Global L2 norm of the gradients of `vars`.
pub fn grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt())
}

/// Clip gradients so their global L2 norm ≤ `max_norm`; returns the norm
/// before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let norm = grad_norm(grads, vars)?;
    if norm <= max_norm || norm == 0.0 {
        return Ok(norm);
    }
    let scale = max_norm / norm;
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
        }
    }
    Ok(norm)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn var(name: &str, values: &[f32]) -> (String, Var) {
        let v = Var::from_tensor(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap();
        (name.to_string(), v)
    }

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.to_vec1::<f32>().unwrap()
    }

    #[test]
    fn no_decay_names() {
        assert!(is_no_decay("bert.encoder.layer.0.attention.self.query.bias"));
        assert!(is_no_decay("bert.embeddings.LayerNorm.weight"));
        assert!(is_no_decay("cls.predictions.bias"));
        assert!(!is_no_decay("bert.encoder.layer.0.attention.self.query.weight"));
        assert!(!is_no_decay("bert.embeddings.word_embeddings.weight"));
    }

    #[test]
    fn groups_are_partitioned() {
        let vars = vec![
            var("a.weight", &[1.0]),
            var("a.bias", &[1.0]),
            var("b.LayerNorm.weight", &[1.0]),
        ];
        let opt = GroupedAdamW::new(&vars, AdamWSettings::default()).unwrap();
        assert_eq!(opt.group_sizes(), (1, 2));
    }

    #[test]
    fn weight_decay_skips_bias() {
        let vars = vec![var("w.weight", &[1.0]), var("w.bias", &[1.0])];
        let settings = AdamWSettings {
            lr: 0.1,
            eps: 1e-8,
            weight_decay: 0.5,
        };
        let mut opt = GroupedAdamW::new(&vars, settings).unwrap();

        // Same start values and gradients, plain AdamW without decay.
        let reference = vec![var("w.weight", &[1.0]).1, var("w.bias", &[1.0]).1];
        let mut plain = AdamW::new(
            reference.clone(),
            ParamsAdamW {
                lr: settings.lr,
                eps: settings.eps,
                weight_decay: 0.0,
                ..Default::default()
            },
        )
        .unwrap();

        let grouped_loss = (vars[0].1.as_tensor() + vars[1].1.as_tensor())
            .unwrap()
            .sum_all()
            .unwrap();
        let grouped_grads = grouped_loss.backward().unwrap();
        assert!(grouped_grads.get(vars[0].1.as_tensor()).is_some());
        opt.step(&grouped_grads).unwrap();

        let plain_loss = (reference[0].as_tensor() + reference[1].as_tensor())
            .unwrap()
            .sum_all()
            .unwrap();
        plain.step(&plain_loss.backward().unwrap()).unwrap();

        let w = to_vec(vars[0].1.as_tensor())[0];
        let b = to_vec(vars[1].1.as_tensor())[0];
        let w_ref = to_vec(reference[0].as_tensor())[0];
        let b_ref = to_vec(reference[1].as_tensor())[0];
        assert!(w_ref < 1.0, "gradient step did not move the reference");

        // Decoupled decay: θ ← θ·(1 - lr·wd) before the Adam update.
        let decay = (settings.lr * settings.weight_decay) as f32;
        assert!((w_ref - w - decay).abs() < 1e-6, "decayed {w} vs plain {w_ref}");
        assert!((b - b_ref).abs() < 1e-7, "bias must not decay: {b} vs {b_ref}");
    }

    #[test]
    fn learning_rate_reaches_both_groups() {
        let vars = vec![var("w.weight", &[1.0]), var("w.bias", &[1.0])];
        let mut opt = GroupedAdamW::new(&vars, AdamWSettings::default()).unwrap();
        opt.set_learning_rate(0.25);
        assert_eq!(opt.learning_rate(), 0.25);
        assert_eq!(opt.no_decay.learning_rate(), 0.25);
    }

    #[test]
    fn accumulator_sums_micro_batches() {
        let (_, w) = var("w", &[1.0, 2.0]);
        let mut acc = GradAccumulator::new(vec![w.clone()]);
        for scale in [1.0, 3.0] {
            let loss = (w.as_tensor() * scale).unwrap().sum_all().unwrap();
            acc.add(loss.backward().unwrap()).unwrap();
        }
        assert_eq!(acc.micro_steps(), 2);
        let grads = acc.take().unwrap();
        assert_eq!(to_vec(grads.get(w.as_tensor()).unwrap()), vec![4.0, 4.0]);
        assert_eq!(acc.micro_steps(), 0);
        assert!(acc.take().is_none());
    }

    #[test]
    fn scaled_micro_batches_sum_to_their_mean() {
        let (_, w) = var("w", &[1.0, -2.0]);
        let mut acc = GradAccumulator::new(vec![w.clone()]);
        for factor in [3.0, 5.0] {
            let loss = (w.as_tensor() * factor).unwrap().sum_all().unwrap();
            let loss = scale_for_accumulation(loss, 2).unwrap();
            acc.add(loss.backward().unwrap()).unwrap();
        }
        assert_eq!(to_vec(acc.accumulated(&w).unwrap()), vec![4.0, 4.0]);
        assert_eq!(to_vec(acc.take().unwrap().get(w.as_tensor()).unwrap()), vec![4.0, 4.0]);
    }

    #[test]
    fn no_scaling_without_accumulation() {
        let loss = Tensor::new(3.0f32, &Device::Cpu).unwrap();
        let scaled = scale_for_accumulation(loss, 1).unwrap();
        assert_eq!(scaled.to_scalar::<f32>().unwrap(), 3.0);
    }

    #[test]
    fn clipping_scales_to_max_norm() {
        let (_, w) = var("w", &[0.0, 0.0]);
        let target = Tensor::new(&[3.0f32, 4.0], &Device::Cpu).unwrap();
        let loss = (w.as_tensor() * &target).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();

        let vars = vec![w.clone()];
        assert!((grad_norm(&grads, &vars).unwrap() - 5.0).abs() < 1e-6);
        let before = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((before - 5.0).abs() < 1e-6);
        let clipped = to_vec(grads.get(w.as_tensor()).unwrap());
        assert!((clipped[0] - 0.6).abs() < 1e-6);
        assert!((clipped[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn clipping_leaves_small_gradients() {
        let w = Var::zeros(2, DType::F32, &Device::Cpu).unwrap();
        let loss = (w.as_tensor() * 0.1).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        clip_grad_norm(&mut grads, &[w.clone()], 1.0).unwrap();
        let g = to_vec(grads.get(w.as_tensor()).unwrap());
        assert!((g[0] - 0.1).abs() < 1e-6);
    }
}
