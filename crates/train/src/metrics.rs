//! Throughput and execution metrics.
//!
//! [`RateTracker`] gives a smoothed samples/sec for progress display;
//! [`ExecutionReport`] aggregates per-replica counters over the run and is
//! logged at the end when requested.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Smoothed items-per-second counter.
#[derive(Debug, Clone)]
pub struct RateTracker {
    smooth_factor: f64,
    start: Instant,
    last: Instant,
    count: u64,
    pending: u64,
    rate: Option<f64>,
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new(0.4)
    }
}

impl RateTracker {
    /// `smooth_factor` is the weight kept by the previous rate on each update.
    pub fn new(smooth_factor: f64) -> Self {
        let now = Instant::now();
        Self {
            smooth_factor: smooth_factor.clamp(0.0, 1.0),
            start: now,
            last: now,
            count: 0,
            pending: 0,
            rate: None,
        }
    }

    pub fn add(&mut self, n: usize) {
        self.count += n as u64;
        self.pending += n as u64;
    }

    /// Smoothed rate, folding in everything added since the last call.
    pub fn rate(&mut self) -> f64 {
        let now = Instant::now();
        let dt = now.duration_since(self.last).as_secs_f64();
        if dt <= 0.0 {
            return self.rate.unwrap_or(0.0);
        }
        let instant = self.pending as f64 / dt;
        let smoothed = match self.rate {
            Some(prev) => self.smooth_factor * prev + (1.0 - self.smooth_factor) * instant,
            None => instant,
        };
        self.rate = Some(smoothed);
        self.pending = 0;
        self.last = now;
        smoothed
    }

    /// Items per second since construction.
    pub fn global_rate(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.count as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

// ── Execution report ────────────────────────────────────────────────────────

/// Counters for one replica over one epoch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplicaMetrics {
    pub rank: usize,
    pub steps: usize,
    pub optimizer_steps: usize,
    pub samples: u64,
    pub seconds: f64,
}

impl ReplicaMetrics {
    fn merge(&mut self, other: &ReplicaMetrics) {
        self.steps += other.steps;
        self.optimizer_steps += other.optimizer_steps;
        self.samples += other.samples;
        self.seconds += other.seconds;
    }

    pub fn samples_per_sec(&self) -> f64 {
        if self.seconds > 0.0 {
            self.samples as f64 / self.seconds
        } else {
            0.0
        }
    }
}

/// Whole-run counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub epochs: usize,
    pub replicas: Vec<ReplicaMetrics>,
    pub all_reduces: usize,
    pub all_reduce_wait_secs: f64,
    pub wall_secs: f64,
}

impl ExecutionReport {
    /// Fold one epoch's per-replica counters into the report.
    pub fn record_epoch(&mut self, replicas: &[ReplicaMetrics], wall: Duration) {
        self.epochs += 1;
        self.wall_secs += wall.as_secs_f64();
        for m in replicas {
            match self.replicas.iter_mut().find(|r| r.rank == m.rank) {
                Some(total) => total.merge(m),
                None => self.replicas.push(m.clone()),
            }
        }
    }

    pub fn set_all_reduce(&mut self, count: usize, wait: Duration) {
        self.all_reduces = count;
        self.all_reduce_wait_secs = wait.as_secs_f64();
    }

    pub fn total_samples(&self) -> u64 {
        self.replicas.iter().map(|r| r.samples).sum()
    }

    pub fn log(&self) {
        tracing::info!(
            epochs = self.epochs,
            wall_secs = format!("{:.1}", self.wall_secs),
            samples = self.total_samples(),
            all_reduces = self.all_reduces,
            all_reduce_wait_secs = format!("{:.2}", self.all_reduce_wait_secs),
            "execution report"
        );
        for r in &self.replicas {
            tracing::info!(
                replica = r.rank,
                steps = r.steps,
                optimizer_steps = r.optimizer_steps,
                samples = r.samples,
                samples_per_sec = format!("{:.1}", r.samples_per_sec()),
                "replica metrics"
            );
        }
    }
}
