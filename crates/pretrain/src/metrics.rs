use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::TrainingError;

/// Wall-clock throughput between successive logging points.
#[derive(Debug)]
pub struct ThroughputWindow {
    window_start: Instant,
    micro_batch_size: usize,
    accumulation_steps: usize,
    log_freq: usize,
    avg_seq_per_pack: f64,
    last: Option<WindowStats>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    /// Seconds per micro-step over the window.
    pub average_training_time_per_step: f64,
    /// Sequences per second per participant.
    pub average_perf_per_step: f64,
}

impl ThroughputWindow {
    pub fn new(
        micro_batch_size: usize,
        accumulation_steps: usize,
        log_freq: usize,
        avg_seq_per_pack: f64,
    ) -> Self {
        Self {
            window_start: Instant::now(),
            micro_batch_size,
            accumulation_steps: accumulation_steps.max(1),
            log_freq: log_freq.max(1),
            avg_seq_per_pack,
            last: None,
        }
    }

    /// Closes the current window and opens the next one.
    pub fn close(&mut self) -> WindowStats {
        let now = Instant::now();
        let stats = self.stats_for(now.duration_since(self.window_start));
        self.window_start = now;
        self.last = Some(stats);
        stats
    }

    pub fn stats_for(&self, window: Duration) -> WindowStats {
        let steps = (self.accumulation_steps * self.log_freq) as f64;
        let per_step = window.as_secs_f64() / steps;
        let perf = if per_step > 0.0 {
            self.micro_batch_size as f64 * self.avg_seq_per_pack / per_step
        } else {
            0.0
        };
        WindowStats {
            average_training_time_per_step: per_step,
            average_perf_per_step: perf,
        }
    }

    pub fn last(&self) -> Option<WindowStats> {
        self.last
    }
}

/// One row of `compute_logs_<rank>.csv`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputeLogRow {
    pub global_step: usize,
    pub local_step: usize,
    pub world_size: usize,
    pub batch: usize,
    pub sentence_length: usize,
    pub computed_batch: usize,
    pub compute_dropped: bool,
    /// Seconds since the Unix epoch.
    pub fwd_start: f64,
    pub step_end: f64,
}

/// Per-rank macro-step timing rows, written once at the end of training.
#[derive(Debug)]
pub struct ComputeLog {
    path: PathBuf,
    rows: Vec<ComputeLogRow>,
}

impl ComputeLog {
    pub fn new(log_dir: &Path, rank: usize) -> Self {
        Self {
            path: log_dir.join(format!("compute_logs_{rank}.csv")),
            rows: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn push(&mut self, row: ComputeLogRow) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[ComputeLogRow] {
        &self.rows
    }

    pub fn write(&self) -> Result<(), TrainingError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(&self.path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create compute log {}: {err}",
                self.path.display()
            ))
        })?;
        // Header is written even when no row was recorded.
        if self.rows.is_empty() {
            writer
                .write_record([
                    "global_step",
                    "local_step",
                    "world_size",
                    "batch",
                    "sentence_length",
                    "computed_batch",
                    "compute_dropped",
                    "fwd_start",
                    "step_end",
                ])
                .map_err(|err| TrainingError::runtime(format!("failed to write compute log: {err}")))?;
        }
        for row in &self.rows {
            writer
                .serialize(row)
                .map_err(|err| TrainingError::runtime(format!("failed to write compute log: {err}")))?;
        }
        writer
            .flush()
            .map_err(|err| TrainingError::runtime(format!("failed to flush compute log: {err}")))
    }
}

/// Aggregated end-of-run metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingSummary {
    /// Cluster-averaged loss of the last logging window.
    pub final_loss: f64,
    pub global_step: usize,
    pub skipped_steps: usize,
    /// Micro-steps this participant abandoned after a compute timeout.
    pub dropped_micro_steps: usize,
    pub train_time_raw: f64,
    /// Seconds since the first macro-step after warmup.
    pub net_train_time: f64,
    pub average_training_time_per_step: f64,
    pub average_perf_per_step: f64,
    pub training_sequences_per_second: f64,
}

/// Sequences processed per second over the whole run, across all
/// participants.
pub fn training_sequences_per_second(
    micro_batch_size: usize,
    accumulation_steps: usize,
    world_size: usize,
    avg_seq_per_pack: f64,
    steps_done: usize,
    train_time_raw: f64,
) -> f64 {
    if train_time_raw <= 0.0 {
        return 0.0;
    }
    (micro_batch_size * accumulation_steps * world_size) as f64
        * avg_seq_per_pack
        * steps_done as f64
        / train_time_raw
}
