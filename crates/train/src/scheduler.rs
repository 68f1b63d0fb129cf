//! Learning-rate schedule: linear warmup → linear / cosine / constant.
//!
//! Multiplier semantics follow the `WarmupLinearSchedule` family: the rate is
//! `0` at step 0, rises linearly to the base rate at `warmup_steps`, then
//! decays to `0` at `total_steps`.

use std::str::FromStr;

/// Decay mode after warmup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LrDecay {
    Linear,
    Cosine,
    None,
}

impl FromStr for LrDecay {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Self::Linear),
            "cosine" => Ok(Self::Cosine),
            "none" | "constant" => Ok(Self::None),
            other => anyhow::bail!("unknown lr decay {other:?} (expected linear, cosine or none)"),
        }
    }
}

/// Per-optimizer-step learning rate.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    step: usize,
    lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    decay: LrDecay,
}

impl LrScheduler {
    pub fn new(lr: f64, warmup_steps: usize, total_steps: usize, decay: LrDecay) -> Self {
        Self {
            step: 0,
            lr,
            warmup_steps,
            total_steps,
            decay,
        }
    }

    /// Factor applied to the base rate at the current step.
    pub fn multiplier(&self) -> f64 {
        let step = self.step as f64;
        let warmup = self.warmup_steps as f64;
        let total = self.total_steps as f64;

        if self.step < self.warmup_steps {
            return step / warmup.max(1.0);
        }
        let span = (total - warmup).max(1.0);
        match self.decay {
            LrDecay::None => 1.0,
            LrDecay::Linear => ((total - step) / span).max(0.0),
            LrDecay::Cosine => {
                let progress = (step - warmup) / span;
                if progress >= 1.0 {
                    0.0
                } else {
                    0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
                }
            }
        }
    }

    pub fn current_lr(&self) -> f64 {
        self.lr * self.multiplier()
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
