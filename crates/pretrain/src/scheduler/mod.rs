use crate::{config, TrainingError};

pub trait LRScheduler: Send {
    /// Advances one optimizer step and returns the new learning rate.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    /// Number of `step` calls so far, including any restored offset.
    fn last_step(&self) -> usize;
}

/// Linear warmup followed by square-root polynomial decay, both expressed as
/// a fraction of `total_steps`.
#[derive(Debug, Clone)]
pub struct PolyWarmUpScheduler {
    base_lr: f64,
    warmup: f64,
    degree: f64,
    total_steps: usize,
    step: usize,
    current_lr: f64,
}

impl PolyWarmUpScheduler {
    pub fn new(base_lr: f64, warmup: f64, total_steps: usize) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
        if !(0.0..1.0).contains(&warmup) {
            return Err(TrainingError::initialization(
                "scheduler warmup must be in [0, 1)",
            ));
        }
        Ok(Self {
            base_lr,
            warmup,
            degree: 0.5,
            total_steps,
            step: 0,
            current_lr: base_lr,
        })
    }

    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        total_steps: usize,
    ) -> Result<Self, TrainingError> {
        Self::new(base_lr, cfg.warmup_proportion, total_steps)
    }

    /// Positions the schedule after `step` completed optimizer steps.
    pub fn resume_at(&mut self, step: usize) {
        self.step = step;
        self.current_lr = self.compute_lr(step);
    }

    fn compute_lr(&self, step: usize) -> f64 {
        let progress = step as f64 / self.total_steps as f64;
        if progress < self.warmup {
            self.base_lr * progress / self.warmup
        } else {
            let decay = ((progress - 1.0) / (self.warmup - 1.0)).max(0.0);
            self.base_lr * decay.powf(self.degree)
        }
    }
}

impl LRScheduler for PolyWarmUpScheduler {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.current_lr = self.compute_lr(self.step);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn last_step(&self) -> usize {
        self.step
    }
}
