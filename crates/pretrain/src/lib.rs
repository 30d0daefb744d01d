//! Distributed BERT pretraining driver with per-step compute deadlines.
//!
//! Every participant runs the same [`Trainer`]: micro-steps accumulate
//! gradients until the window is full or the [`DeadlineGuard`] drops the
//! current micro-step, then the [`GradientSynchronizer`] reduces the window
//! across participants and applies one optimizer step unless any of them
//! saw an overflow.

pub mod checkpoint;
pub mod collective;
pub mod compute;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod sync;
pub mod timer;
pub mod trainer;

pub use collective::{Communicator, DistributedIdentity, SingleProcess, ThreadGroup};
pub use compute::AccumulationState;
pub use config::{ResolvedTraining, SyncMode, TrainingConfig};
pub use data::{DataCursor, DataPipeline, PretrainingBatch, ShardSchedule};
pub use error::TrainingError;
pub use logging::{init_tracing, StepKey, StepLogger};
pub use metrics::TrainingSummary;
pub use optimizer::{GradientScaler, OverflowBuffer, TrainerOptimizer};
pub use scheduler::{LRScheduler, PolyWarmUpScheduler};
pub use sync::{GradientAccumulator, GradientSynchronizer, StepCounters, SyncOutcome};
pub use timer::{CandleStream, ComputeTimeout, DeadlineGuard, DeviceStream, HostStream, StepClock};
pub use trainer::{MacroStepRecord, MicroStepOutcome, Trainer};
