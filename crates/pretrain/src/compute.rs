use std::time::{Duration, Instant};

use crate::{collective::Communicator, TrainingError};

/// Per-macro-step record of how much of the intended batch was actually
/// computed before any drop, and the drop policy in force for the step.
#[derive(Debug, Clone)]
pub struct AccumulationState {
    computed_count: usize,
    threshold: Duration,
    enabled: bool,
    macro_step_start: Instant,
    target_micro_batch_size: usize,
    reduced: bool,
}

impl AccumulationState {
    pub fn new(target_micro_batch_size: usize) -> Self {
        Self {
            computed_count: 0,
            threshold: Duration::ZERO,
            enabled: false,
            macro_step_start: Instant::now(),
            target_micro_batch_size,
            reduced: false,
        }
    }

    /// Begins the accounting for a new macro-step.
    pub fn reset_state(
        &mut self,
        threshold: Duration,
        enabled: bool,
        start_time: Instant,
        target_micro_batch_size: usize,
    ) {
        self.threshold = threshold;
        self.enabled = enabled;
        self.macro_step_start = start_time;
        self.target_micro_batch_size = target_micro_batch_size;
        self.computed_count = 0;
        self.reduced = false;
    }

    /// Counts a micro-step whose forward and backward both finished.
    pub fn record_completed(&mut self, micro_batch_size: usize) {
        self.computed_count += micro_batch_size;
    }

    /// Replaces the local tally with the sum over all participants. Must be
    /// called by every participant at the same macro-step boundary.
    pub fn reduce(&mut self, comm: &dyn Communicator) -> Result<usize, TrainingError> {
        let mut buffer = [self.computed_count as f32];
        comm.all_reduce_sum(&mut buffer)?;
        self.computed_count = buffer[0].round() as usize;
        self.reduced = true;
        Ok(self.computed_count)
    }

    pub fn computed_count(&self) -> usize {
        self.computed_count
    }

    pub fn is_reduced(&self) -> bool {
        self.reduced
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn macro_step_start(&self) -> Instant {
        self.macro_step_start
    }

    pub fn target_micro_batch_size(&self) -> usize {
        self.target_micro_batch_size
    }
}
