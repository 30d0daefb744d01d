//! The per-participant training loop.
//!
//! Each micro-step pulls a batch, runs forward and backward under the
//! [`DeadlineGuard`], and either completes or is dropped. A macro-step ends
//! when the accumulation window is full or a micro-step was dropped; the
//! loop then reduces the computed-example count, lets the
//! [`GradientSynchronizer`] decide on the optimizer step, re-arms the guard
//! and considers logging and checkpointing.

use std::{
    collections::VecDeque,
    path::PathBuf,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use bert::{Criterion, ForwardError, PretrainingModel};
use candle_core::{DType, Device, Tensor, Var};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{self, SaveRequest},
    collective::{all_agree_any, all_reduce_scalar, Communicator},
    compute::AccumulationState,
    config::{ResolvedTraining, StepAnchor, TrainingConfig},
    data::{self, DataCursor, DataPipeline, DatasetOptions, PretrainingBatch, ShardSchedule},
    error::to_runtime_error,
    logging::{metric, LoggingSettings, StepKey, StepLogger},
    metrics::{self, ComputeLog, ComputeLogRow, ThroughputWindow, TrainingSummary},
    optimizer::{GradientScaler, OptimizerSettings, TrainerOptimizer},
    scheduler::{LRScheduler, PolyWarmUpScheduler},
    sync::{GradientAccumulator, GradientSynchronizer, StepCounters, SyncOutcome},
    timer::{DeadlineGuard, DeviceStream, HostStream},
    TrainingError,
};

/// Result of one micro-step's forward and backward.
#[derive(Debug, Clone, PartialEq)]
pub enum MicroStepOutcome {
    Completed { loss: f64 },
    /// The deadline passed at the hook named `label`.
    Dropped { label: String },
}

/// What happened at one macro-step boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroStepRecord {
    /// Macro-step counter after the boundary.
    pub global_step: usize,
    /// Micro-steps run in the window, including a dropped one.
    pub micro_steps: usize,
    /// Examples completed across all participants.
    pub computed_count: usize,
    pub dropped: bool,
    pub sync: SyncOutcome,
    pub learning_rate: f64,
}

/// Boundary records kept by default; older ones are discarded first.
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

/// Where a run picks up.
struct StartPoint {
    counters: StepCounters,
    data: Option<(ShardSchedule, DataCursor)>,
}

pub struct Trainer<M, C, S = HostStream>
where
    M: PretrainingModel,
    C: Criterion,
    S: DeviceStream,
{
    config: TrainingConfig,
    resolved: ResolvedTraining,
    comm: Box<dyn Communicator>,
    model: M,
    criterion: C,
    parameters: Vec<(String, Var)>,
    optimizer: TrainerOptimizer,
    scheduler: PolyWarmUpScheduler,
    scaler: GradientScaler,
    synchronizer: GradientSynchronizer,
    accumulator: GradientAccumulator,
    guard: DeadlineGuard<S>,
    accumulation: AccumulationState,
    counters: StepCounters,
    resume_step: usize,
    data: DataPipeline,
    logger: StepLogger,
    compute_log: ComputeLog,
    history: VecDeque<MacroStepRecord>,
    history_limit: usize,
    dropped_micro_steps: usize,
}

impl<M, C, S> Trainer<M, C, S>
where
    M: PretrainingModel,
    C: Criterion,
    S: DeviceStream,
{
    /// Prepares a participant: output directory, dataset geometry, resume
    /// state, parameter broadcast from rank 0, optimizer and data stream.
    pub fn new(
        config: TrainingConfig,
        comm: Box<dyn Communicator>,
        model: M,
        criterion: C,
        stream: S,
        device: Device,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        config.prepare_output_dir(comm.is_main_process())?;

        let avg_seq_per_pack = if config.data.enable_packed_data_mode {
            data::read_avg_seq_per_sample(&config.data.input_dir, config.data.max_seq_length)?
        } else {
            1.0
        };
        let resolved = config.resolve(avg_seq_per_pack);

        let logger = if comm.is_main_process() {
            StepLogger::new(LoggingSettings::for_rank(true, &resolved.log_dir))?
        } else {
            StepLogger::disabled()
        };

        let parameters = model.named_parameters();
        let mut optimizer = TrainerOptimizer::new(
            parameters.clone(),
            OptimizerSettings::from(&config.optimizer),
            &config.optimizer.no_decay,
        )?;
        let mut scaler = GradientScaler::with_config(config.loss_scale());

        let start = load_start_point(&config, &parameters, &mut optimizer, &mut scaler, &device)?;
        broadcast_parameters(comm.as_ref(), &parameters)?;

        let mut scheduler = PolyWarmUpScheduler::from_training_config(
            &config.scheduler,
            config.optimizer.learning_rate,
            config.runtime.max_steps,
        )?;
        scheduler.resume_at(start.counters.global_step);

        let data = DataPipeline::start(
            &config.data.input_dir,
            DatasetOptions {
                max_predictions_per_seq: config.data.max_predictions_per_seq,
                packed: config.data.enable_packed_data_mode,
                micro_batch_size: resolved.micro_batch_size,
                seed: config.runtime.seed,
            },
            comm.rank(),
            comm.world_size(),
            device,
            start.data,
        )?;

        let accumulator = GradientAccumulator::new(parameters.iter().map(|(_, var)| var));
        let synchronizer = GradientSynchronizer::new(resolved.sync_mode, resolved.accumulation_steps)
            .with_fp16_reduction(config.distributed.allreduce_fp16);
        let guard = DeadlineGuard::new(stream, config.compute_drop.event_sync_delay);
        let compute_log = ComputeLog::new(&resolved.log_dir, comm.rank());

        info!(
            rank = comm.rank(),
            world_size = comm.world_size(),
            micro_batch_size = resolved.micro_batch_size,
            accumulation_steps = resolved.accumulation_steps,
            sync_mode = ?resolved.sync_mode,
            global_step = start.counters.global_step,
            "participant online"
        );

        Ok(Self {
            accumulation: AccumulationState::new(resolved.micro_batch_size),
            resume_step: start.counters.global_step,
            counters: start.counters,
            config,
            resolved,
            comm,
            model,
            criterion,
            parameters,
            optimizer,
            scheduler,
            scaler,
            synchronizer,
            accumulator,
            guard,
            data,
            logger,
            compute_log,
            history: VecDeque::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            dropped_micro_steps: 0,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn resolved(&self) -> &ResolvedTraining {
        &self.resolved
    }

    pub fn counters(&self) -> StepCounters {
        self.counters
    }

    /// The most recent macro-step boundaries, oldest first.
    pub fn history(&self) -> &VecDeque<MacroStepRecord> {
        &self.history
    }

    /// Caps how many boundary records are retained. Zero keeps none.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self.trim_history();
        self
    }

    fn trim_history(&mut self) {
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    pub fn accumulation(&self) -> &AccumulationState {
        &self.accumulation
    }

    pub fn guard(&self) -> &DeadlineGuard<S> {
        &self.guard
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &TrainerOptimizer {
        &self.optimizer
    }

    pub fn train(&mut self) -> Result<TrainingSummary, TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs until the step budget is reached or `should_stop` returns true on
    /// any participant at a macro-step boundary.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<TrainingSummary, TrainingError>
    where
        F: FnMut() -> bool,
    {
        self.log_parameters()?;

        let accumulation_steps = self.resolved.accumulation_steps;
        let log_freq = self.config.runtime.log_freq;
        let warmup_steps = self.config.compute_drop.enable_after_step;
        let mut throughput = ThroughputWindow::new(
            self.resolved.micro_batch_size,
            accumulation_steps,
            log_freq,
            self.resolved.avg_seq_per_pack,
        );
        let raw_start = Instant::now();
        let mut net_start: Option<Instant> = None;
        let mut window_start = SystemTime::now();
        let mut micro_steps = 0usize;
        let mut boundaries = 0usize;
        let mut window_loss = 0.0f64;
        let mut last_loss = 0.0f64;

        self.rearm();

        loop {
            let batch = self.data.next_batch()?;
            micro_steps += 1;

            let mut boundary = micro_steps >= accumulation_steps;
            match self.compute(&batch)? {
                MicroStepOutcome::Completed { loss } => {
                    window_loss += loss;
                    last_loss = loss;
                }
                MicroStepOutcome::Dropped { label } => {
                    boundary = true;
                    self.dropped_micro_steps += 1;
                    if self.config.compute_drop.debug {
                        debug!(
                            rank = self.comm.rank(),
                            module = %label,
                            local_step = micro_steps,
                            accumulation_steps,
                            "dropped micro-step"
                        );
                    }
                }
            }
            if !boundary {
                continue;
            }

            let step_end = SystemTime::now();
            let record = self.synchronize(micro_steps)?;
            boundaries += 1;

            if self.counters.global_step == warmup_steps + 1 && net_start.is_none() {
                net_start = Some(Instant::now());
            }
            if self.counters.global_step > warmup_steps {
                self.compute_log.push(ComputeLogRow {
                    global_step: self.counters.global_step,
                    local_step: micro_steps,
                    world_size: self.comm.world_size(),
                    batch: batch.batch_size(),
                    sentence_length: batch.sequence_length(),
                    computed_batch: record.computed_count,
                    compute_dropped: record.dropped,
                    fwd_start: unix_seconds(window_start),
                    step_end: unix_seconds(step_end),
                });
            }
            let stepped = record.sync.stepped;
            self.history.push_back(record);
            self.trim_history();
            micro_steps = 0;
            window_start = SystemTime::now();

            let stop_requested = all_agree_any(self.comm.as_ref(), should_stop())?;
            let finished = self.counters.global_step >= self.resolved.steps_this_run || stop_requested;
            let log_point = boundaries % log_freq == 0;
            if finished || log_point {
                throughput.close();
            }

            if !finished && log_point {
                let stats = throughput.last().unwrap_or_else(|| throughput.stats_for(Duration::ZERO));
                let mut data = Map::new();
                data.insert(
                    "average_loss".into(),
                    metric(window_loss / (log_freq * accumulation_steps) as f64),
                );
                data.insert("step_loss".into(), metric(last_loss));
                data.insert("learning_rate".into(), metric(self.optimizer.learning_rate()));
                data.insert(
                    "average_training_time_step".into(),
                    metric(stats.average_training_time_per_step),
                );
                data.insert("average_perf_per_step".into(), metric(stats.average_perf_per_step));
                data.insert("skipped_steps".into(), Value::from(self.counters.skipped_steps));
                data.insert("dropped_micro_steps".into(), Value::from(self.dropped_micro_steps));
                self.logger.log(self.training_key(), data);
                window_loss = 0.0;
            }

            let interval = self.config.runtime.num_steps_per_checkpoint;
            if finished || (stepped && self.counters.global_step % interval == 0) {
                self.save_checkpoint()?;
            }

            if finished {
                if stop_requested {
                    info!(global_step = self.counters.global_step, "shutdown requested, stopping");
                }
                let last_window = match boundaries % log_freq {
                    0 => log_freq,
                    n => n,
                };
                let local_loss = window_loss / (last_window * accumulation_steps) as f64;
                return self.finish(local_loss, raw_start, net_start, &throughput);
            }
        }
    }

    fn threshold(&self) -> Duration {
        Duration::from_secs_f64(self.config.compute_drop.compute_threshold.max(0.0))
    }

    fn drop_enabled(&self) -> bool {
        let cfg = &self.config.compute_drop;
        let reference = match cfg.anchor {
            StepAnchor::Absolute => self.counters.global_step,
            StepAnchor::Relative => self.counters.global_step.saturating_sub(self.resume_step),
        };
        reference > cfg.enable_after_step && cfg.threshold_enabled()
    }

    fn training_key(&self) -> StepKey {
        StepKey::Training {
            epoch: self.data.epoch(),
            global_step: self.counters.global_step,
        }
    }

    /// Forward, loss and backward for one micro-batch. A hook interruption
    /// ends the micro-step without a gradient contribution.
    pub fn compute(&mut self, batch: &PretrainingBatch) -> Result<MicroStepOutcome, TrainingError> {
        let forward = self
            .model
            .forward(&batch.inputs, &self.guard)
            .and_then(|output| {
                self.criterion.loss(
                    &output,
                    &batch.masked_lm_labels,
                    &batch.next_sentence_labels,
                    &self.guard,
                )
            });

        let loss = match forward {
            Ok(loss) => loss,
            Err(ForwardError::Interrupted(interrupted)) => {
                if let Some(timeout) = self.guard.take_timeout() {
                    debug!(
                        module = %timeout.label,
                        elapsed_s = timeout.elapsed.as_secs_f64(),
                        "compute timeout"
                    );
                }
                return Ok(MicroStepOutcome::Dropped {
                    label: interrupted.label,
                });
            }
            Err(ForwardError::Candle(err)) => return Err(to_runtime_error(err)),
        };

        let value = loss
            .to_dtype(DType::F32)
            .and_then(|t| t.to_vec0::<f32>())
            .map_err(to_runtime_error)? as f64;
        let divisor = self.synchronizer.loss_divisor() as f64;
        let normalized = loss.affine(1.0 / divisor, 0.0).map_err(to_runtime_error)?;
        let scaled = self.scaler.scale(&normalized)?;
        let grads = scaled.backward().map_err(to_runtime_error)?;
        self.accumulator.accumulate(&grads)?;
        self.accumulation.record_completed(batch.batch_size());

        Ok(MicroStepOutcome::Completed { loss: value })
    }

    /// Macro-step boundary: schedule, reduce, step, then re-arm the guard
    /// for the next window.
    fn synchronize(&mut self, micro_steps: usize) -> Result<MacroStepRecord, TrainingError> {
        let learning_rate = self.scheduler.step();
        self.optimizer.set_learning_rate(learning_rate);

        let computed_count = self.accumulation.reduce(self.comm.as_ref())?;
        let sync = self.synchronizer.step(
            self.comm.as_ref(),
            &mut self.accumulator,
            &mut self.optimizer,
            &mut self.scaler,
            &mut self.counters,
        )?;
        if sync.overflow {
            let mut data = Map::new();
            data.insert("loss_scale".into(), Value::from(sync.loss_scale));
            self.logger.log(StepKey::Parameter, data);
        }
        if self.config.compute_drop.debug && self.comm.is_main_process() {
            debug!(
                global_step = self.counters.global_step,
                computed_count,
                "macro-step compute"
            );
        }

        let dropped = self.guard.dropped();
        self.rearm();

        Ok(MacroStepRecord {
            global_step: self.counters.global_step,
            micro_steps,
            computed_count,
            dropped,
            sync,
            learning_rate,
        })
    }

    /// Restarts the step clock and the per-window state for the next
    /// macro-step.
    fn rearm(&mut self) {
        let enabled = self.drop_enabled();
        let threshold = self.threshold();
        self.guard.reset();
        self.guard.start();
        self.guard
            .configure(enabled, threshold, self.config.compute_drop.debug);
        self.accumulation.reset_state(
            threshold,
            enabled,
            Instant::now(),
            self.resolved.micro_batch_size,
        );
    }

    fn checkpoint_step(&self) -> usize {
        if self.config.runtime.phase2 {
            self.counters.global_step + self.config.runtime.phase1_end_step
        } else {
            self.counters.global_step
        }
    }

    fn save_checkpoint(&mut self) -> Result<Option<PathBuf>, TrainingError> {
        if !self.comm.is_main_process() || self.config.runtime.skip_checkpoint {
            return Ok(None);
        }
        let mut data = Map::new();
        data.insert("checkpoint_step".into(), Value::from(self.counters.global_step));
        self.logger.log(StepKey::Parameter, data);

        let path = checkpoint::save_checkpoint(SaveRequest {
            output_dir: &self.config.runtime.output_dir,
            checkpoint_step: self.checkpoint_step(),
            config: &self.config,
            parameters: &self.parameters,
            optimizer: &self.optimizer,
            scaler: &self.scaler,
            counters: self.counters,
            schedule: self.data.schedule(),
            cursor: self.data.cursor(),
            max_keep: self.config.runtime.keep_checkpoints,
        })?;
        Ok(Some(path))
    }

    fn log_parameters(&mut self) -> Result<(), TrainingError> {
        if !self.logger.is_active() {
            return Ok(());
        }
        let config = serde_json::to_value(&self.config)
            .map_err(|err| TrainingError::runtime(format!("failed to serialize config: {err}")))?;
        let entries = [
            ("Config", config),
            ("SEED", Value::from(self.config.runtime.seed)),
            ("train_start", Value::from(true)),
            ("batch_size_per_pu", Value::from(self.resolved.micro_batch_size)),
            ("learning_rate", Value::from(self.config.optimizer.learning_rate)),
        ];
        for (key, value) in entries {
            let mut data = Map::new();
            data.insert(key.into(), value);
            self.logger.log(StepKey::Parameter, data);
        }
        Ok(())
    }

    fn finish(
        &mut self,
        local_loss: f64,
        raw_start: Instant,
        net_start: Option<Instant>,
        throughput: &ThroughputWindow,
    ) -> Result<TrainingSummary, TrainingError> {
        let train_time_raw = raw_start.elapsed().as_secs_f64();
        let world = self.comm.world_size();
        self.comm.barrier()?;
        let final_loss = all_reduce_scalar(self.comm.as_ref(), local_loss / world as f64)?;
        let net_train_time = net_start
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or(train_time_raw);
        let stats = throughput
            .last()
            .unwrap_or_else(|| throughput.stats_for(Duration::ZERO));

        let steps_done = (self.counters.global_step + self.counters.skipped_steps)
            .saturating_sub(self.resume_step);
        let summary = TrainingSummary {
            final_loss,
            global_step: self.counters.global_step,
            skipped_steps: self.counters.skipped_steps,
            dropped_micro_steps: self.dropped_micro_steps,
            train_time_raw,
            net_train_time,
            average_training_time_per_step: stats.average_training_time_per_step,
            average_perf_per_step: stats.average_perf_per_step,
            training_sequences_per_second: metrics::training_sequences_per_second(
                self.resolved.micro_batch_size,
                self.resolved.accumulation_steps,
                world,
                self.resolved.avg_seq_per_pack,
                steps_done,
                train_time_raw,
            ),
        };

        let mut data = Map::new();
        data.insert("final_loss".into(), metric(summary.final_loss));
        data.insert(
            "average_training_time_step".into(),
            metric(summary.average_training_time_per_step),
        );
        data.insert("average_perf_per_step".into(), metric(summary.average_perf_per_step));
        data.insert("train_time_net".into(), metric(summary.net_train_time));
        self.logger.log(self.training_key(), data);

        let mut data = Map::new();
        data.insert("e2e_train_time".into(), metric(summary.train_time_raw));
        data.insert(
            "training_sequences_per_second".into(),
            metric(summary.training_sequences_per_second),
        );
        data.insert("final_loss".into(), metric(summary.final_loss));
        data.insert("raw_train_time".into(), metric(summary.train_time_raw));
        data.insert("skipped_steps".into(), Value::from(summary.skipped_steps));
        self.logger.log(StepKey::Final, data);
        self.logger.flush();

        self.compute_log.write()?;
        Ok(summary)
    }
}

/// Restores weights and training state from a checkpoint when resuming.
fn load_start_point(
    config: &TrainingConfig,
    parameters: &[(String, Var)],
    optimizer: &mut TrainerOptimizer,
    scaler: &mut GradientScaler,
    device: &Device,
) -> Result<StartPoint, TrainingError> {
    let runtime = &config.runtime;
    let fresh = StartPoint {
        counters: StepCounters::default(),
        data: None,
    };
    if !runtime.resume_from_checkpoint {
        return Ok(fresh);
    }

    if let Some(path) = runtime.init_checkpoint.as_ref() {
        let weights = checkpoint::load_model_weights(path, device)?;
        checkpoint::apply_model_weights(parameters, weights)?;
        info!(path = %path.display(), "initialized weights from checkpoint");
        return Ok(fresh);
    }

    let step = match runtime.resume_step {
        Some(step) => step,
        None => checkpoint::latest_checkpoint_step(&runtime.output_dir)?.ok_or_else(|| {
            TrainingError::checkpoint(format!(
                "no checkpoint found in {} to resume from",
                runtime.output_dir.display()
            ))
        })?,
    };
    let path = checkpoint::checkpoint_path(&runtime.output_dir, step);
    let loaded = checkpoint::load_checkpoint(&path, device)?;
    if loaded.manifest.config_sha256 != checkpoint::fingerprint_config(config)? {
        warn!(path = %path.display(), "checkpoint was written with a different configuration");
    }
    checkpoint::apply_model_weights(parameters, loaded.model)?;

    let starting_phase2 = runtime.phase2 && step <= runtime.phase1_end_step;
    let mut optimizer_state = loaded.optimizer;
    if starting_phase2 {
        optimizer_state.step = 0;
    }
    optimizer.load_state(optimizer_state)?;
    if let Some(state) = loaded.manifest.scaler {
        scaler.load_state(state);
    }
    info!(path = %path.display(), resume_step = step, "resumed from checkpoint");

    if starting_phase2 {
        return Ok(fresh);
    }
    let schedule = loaded.manifest.schedule()?;
    Ok(StartPoint {
        counters: loaded.manifest.counters(),
        data: Some((schedule, loaded.manifest.data_cursor)),
    })
}

/// Copies rank 0's parameter values to every participant.
pub fn broadcast_parameters(
    comm: &dyn Communicator,
    parameters: &[(String, Var)],
) -> Result<(), TrainingError> {
    if comm.world_size() == 1 {
        return Ok(());
    }
    for (_, var) in parameters {
        let tensor = var.as_tensor();
        let mut host = tensor
            .flatten_all()
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(to_runtime_error)?;
        comm.broadcast(&mut host, 0)?;
        let synced = Tensor::from_vec(host, tensor.dims(), tensor.device())
            .and_then(|t| t.to_dtype(tensor.dtype()))
            .map_err(to_runtime_error)?;
        var.set(&synced).map_err(to_runtime_error)?;
    }
    Ok(())
}

fn unix_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}
