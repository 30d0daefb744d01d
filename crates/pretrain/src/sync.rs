//! Gradient accumulation and the once-per-macro-step reduction that decides
//! whether the optimizer runs.

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use tracing::debug;

use crate::{
    collective::{all_agree_any, Communicator},
    config::SyncMode,
    error::to_runtime_error,
    optimizer::{GradientScaler, OverflowBuffer, TrainerOptimizer},
    TrainingError,
};

/// Sums gradients across the micro-steps of one macro-step.
///
/// Slots stay `None` for parameters that have not received a gradient yet,
/// which is the case for every parameter after a drop on the first
/// micro-step.
#[derive(Debug)]
pub struct GradientAccumulator {
    params: Vec<Var>,
    grads: Vec<Option<Tensor>>,
}

impl GradientAccumulator {
    pub fn new<'a, I>(params: I) -> Self
    where
        I: IntoIterator<Item = &'a Var>,
    {
        let params: Vec<Var> = params.into_iter().cloned().collect();
        let grads = vec![None; params.len()];
        Self { params, grads }
    }

    pub fn accumulate(&mut self, store: &GradStore) -> Result<(), TrainingError> {
        for (param, slot) in self.params.iter().zip(self.grads.iter_mut()) {
            let Some(grad) = store.get(param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            *slot = Some(match slot.take() {
                Some(existing) => existing.add(&grad).map_err(to_runtime_error)?,
                None => grad,
            });
        }
        Ok(())
    }

    pub fn has_gradients(&self) -> bool {
        self.grads.iter().any(Option::is_some)
    }

    pub fn clear(&mut self) {
        self.grads.iter_mut().for_each(|slot| *slot = None);
    }

    /// Takes every gradient in parameter order, zero-filling empty slots so
    /// that all participants contribute buffers of the same length.
    pub fn take_filled(&mut self) -> Result<Vec<Tensor>, TrainingError> {
        let mut out = Vec::with_capacity(self.grads.len());
        for (param, slot) in self.params.iter().zip(self.grads.iter_mut()) {
            let grad = match slot.take() {
                Some(grad) => grad,
                None => param
                    .as_tensor()
                    .zeros_like()
                    .and_then(|t| t.to_dtype(DType::F32))
                    .map_err(to_runtime_error)?,
            };
            out.push(grad);
        }
        Ok(out)
    }
}

/// Macro-step counters owned by the training loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepCounters {
    pub global_step: usize,
    pub skipped_steps: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncOutcome {
    pub overflow: bool,
    pub stepped: bool,
    pub loss_scale: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct GradientSynchronizer {
    mode: SyncMode,
    accumulation_steps: usize,
    flat_dtype: DType,
}

impl GradientSynchronizer {
    pub fn new(mode: SyncMode, accumulation_steps: usize) -> Self {
        Self {
            mode,
            accumulation_steps: accumulation_steps.max(1),
            flat_dtype: DType::F32,
        }
    }

    /// Reduce the post-accumulation buffer at f16 precision.
    pub fn with_fp16_reduction(mut self, enabled: bool) -> Self {
        self.flat_dtype = if enabled { DType::F16 } else { DType::F32 };
        self
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Value the loss is divided by before backward.
    pub fn loss_divisor(&self) -> usize {
        match self.mode {
            SyncMode::PostAccumulation => 1,
            SyncMode::PerStep => self.accumulation_steps,
        }
    }

    /// Reduces the accumulated gradients, agrees on overflow and applies the
    /// optimizer when every participant's gradients are finite. The
    /// accumulator is empty afterwards either way.
    pub fn step(
        &self,
        comm: &dyn Communicator,
        accumulator: &mut GradientAccumulator,
        optimizer: &mut TrainerOptimizer,
        scaler: &mut GradientScaler,
        counters: &mut StepCounters,
    ) -> Result<SyncOutcome, TrainingError> {
        let grads = accumulator.take_filled()?;
        let reduced = self.reduce(comm, grads)?;

        let local_overflow = scaler.has_overflow(&reduced)?;
        let overflow = all_agree_any(comm, local_overflow)?;
        let mut buffer = OverflowBuffer::default();
        buffer.set(overflow);
        scaler.update_with_buffer(buffer);

        if overflow {
            counters.skipped_steps += 1;
            debug!(
                skipped_steps = counters.skipped_steps,
                loss_scale = scaler.loss_scale(),
                "gradient overflow, optimizer step skipped"
            );
            return Ok(SyncOutcome {
                overflow: true,
                stepped: false,
                loss_scale: scaler.loss_scale(),
            });
        }

        let unscaled = reduced
            .iter()
            .map(|grad| scaler.unscale(grad))
            .collect::<Result<Vec<_>, _>>()?;
        optimizer.step(&unscaled)?;
        counters.global_step += 1;

        Ok(SyncOutcome {
            overflow: false,
            stepped: true,
            loss_scale: scaler.loss_scale(),
        })
    }

    /// Cluster-wide mean of `grads`, still carrying the loss scale.
    pub fn reduce(
        &self,
        comm: &dyn Communicator,
        grads: Vec<Tensor>,
    ) -> Result<Vec<Tensor>, TrainingError> {
        let world = comm.world_size();
        match self.mode {
            SyncMode::PostAccumulation => {
                let divisor = (world * self.accumulation_steps) as f64;
                flat_all_reduce(comm, &grads, divisor, self.flat_dtype)
            }
            SyncMode::PerStep => grads
                .iter()
                .map(|grad| {
                    flat_all_reduce(comm, std::slice::from_ref(grad), world as f64, DType::F32)
                        .map(|mut out| out.remove(0))
                })
                .collect(),
        }
    }
}

/// Concatenates `grads`, divides by `divisor`, sums across participants and
/// splits the result back into the original shapes. Contributions and the
/// sum are rounded to `dtype` on the way.
fn flat_all_reduce(
    comm: &dyn Communicator,
    grads: &[Tensor],
    divisor: f64,
    dtype: DType,
) -> Result<Vec<Tensor>, TrainingError> {
    let Some(first) = grads.first() else {
        return Ok(Vec::new());
    };
    let device = first.device().clone();

    let flat_parts = grads
        .iter()
        .map(|grad| grad.flatten_all())
        .collect::<candle_core::Result<Vec<_>>>()
        .map_err(to_runtime_error)?;
    let flat = Tensor::cat(&flat_parts, 0)
        .and_then(|t| t.affine(1.0 / divisor, 0.0))
        .and_then(|t| round_to(&t, dtype))
        .map_err(to_runtime_error)?;
    let mut host = flat.to_vec1::<f32>().map_err(to_runtime_error)?;

    comm.all_reduce_sum(&mut host)?;

    let len = host.len();
    let reduced = Tensor::from_vec(host, len, &device)
        .and_then(|t| round_to(&t, dtype))
        .map_err(to_runtime_error)?;
    let mut offset = 0;
    let mut out = Vec::with_capacity(grads.len());
    for grad in grads {
        let count = grad.elem_count();
        let view = reduced
            .narrow(0, offset, count)
            .and_then(|t| t.reshape(grad.dims()))
            .map_err(to_runtime_error)?;
        out.push(view);
        offset += count;
    }
    Ok(out)
}

fn round_to(tensor: &Tensor, dtype: DType) -> candle_core::Result<Tensor> {
    if dtype == DType::F32 {
        return Ok(tensor.clone());
    }
    tensor.to_dtype(dtype)?.to_dtype(DType::F32)
}

#[cfg(test)]
mod tests {
    use std::thread;

    use candle_core::Device;

    use super::*;
    use crate::{
        collective::{SingleProcess, ThreadGroup},
        optimizer::{AdamConfig, LossScaleConfig, OptimizerSettings},
    };

    fn var(values: &[f32]) -> Var {
        let tensor = Tensor::from_slice(values, values.len(), &Device::Cpu).unwrap();
        Var::from_tensor(&tensor).unwrap()
    }

    fn optimizer_for(params: &[Var]) -> TrainerOptimizer {
        let named = params
            .iter()
            .enumerate()
            .map(|(idx, var)| (format!("p{idx}"), var.clone()))
            .collect();
        let settings = OptimizerSettings::AdamW(AdamConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-6,
            weight_decay: 0.0,
            max_grad_norm: None,
        });
        TrainerOptimizer::new(named, settings, &[]).unwrap()
    }

    /// Loss whose gradient with respect to `param` is `coeffs`.
    fn backward(param: &Var, coeffs: &[f32]) -> GradStore {
        let coeffs = Tensor::from_slice(coeffs, coeffs.len(), &Device::Cpu).unwrap();
        param
            .as_tensor()
            .mul(&coeffs)
            .unwrap()
            .sum_all()
            .unwrap()
            .backward()
            .unwrap()
    }

    #[test]
    fn accumulates_across_micro_steps_and_zero_fills() {
        let a = var(&[1.0, 2.0]);
        let b = var(&[3.0]);
        let mut accumulator = GradientAccumulator::new([&a, &b]);
        assert!(!accumulator.has_gradients());

        accumulator.accumulate(&backward(&a, &[1.0, 2.0])).unwrap();
        accumulator.accumulate(&backward(&a, &[0.5, 0.5])).unwrap();
        assert!(accumulator.has_gradients());

        let grads = accumulator.take_filled().unwrap();
        assert_eq!(grads[0].to_vec1::<f32>().unwrap(), vec![1.5, 2.5]);
        assert_eq!(grads[1].to_vec1::<f32>().unwrap(), vec![0.0]);
        assert!(!accumulator.has_gradients());
    }

    #[test]
    fn post_accumulation_averages_over_world_and_window() {
        let results: Vec<Vec<f32>> = {
            let groups = ThreadGroup::new(2);
            thread::scope(|scope| {
                let handles: Vec<_> = groups
                    .iter()
                    .map(|group| {
                        scope.spawn(move || {
                            let sync = GradientSynchronizer::new(SyncMode::PostAccumulation, 2);
                            let base = if group.rank() == 0 { 2.0f32 } else { 6.0 };
                            let grads = vec![
                                Tensor::new(&[[base, base], [base, base]], &Device::Cpu).unwrap(),
                                Tensor::new(&[base * 2.0], &Device::Cpu).unwrap(),
                            ];
                            let reduced = sync.reduce(group, grads).unwrap();
                            assert_eq!(reduced[0].dims(), &[2, 2]);
                            let mut flat = reduced[0].flatten_all().unwrap().to_vec1::<f32>().unwrap();
                            flat.extend(reduced[1].to_vec1::<f32>().unwrap());
                            flat
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            })
        };
        for result in results {
            assert_eq!(result, vec![2.0, 2.0, 2.0, 2.0, 4.0]);
        }
    }

    #[test]
    fn fp16_reduction_rounds_and_overflows_like_half_precision() {
        let grads = vec![Tensor::new(&[1f32 / 3.0, 1.0e6], &Device::Cpu).unwrap()];
        let full = GradientSynchronizer::new(SyncMode::PostAccumulation, 1)
            .reduce(&SingleProcess, grads.clone())
            .unwrap();
        assert_eq!(full[0].to_vec1::<f32>().unwrap(), vec![1f32 / 3.0, 1.0e6]);

        let half = GradientSynchronizer::new(SyncMode::PostAccumulation, 1)
            .with_fp16_reduction(true)
            .reduce(&SingleProcess, grads)
            .unwrap();
        let values = half[0].to_vec1::<f32>().unwrap();
        let third_in_half = Tensor::new(&[1f32 / 3.0], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0];
        assert_eq!(values[0], third_in_half);
        assert_ne!(values[0], 1f32 / 3.0);
        assert!(values[1].is_infinite());
        assert_eq!(half[0].dtype(), DType::F32);
        assert!(GradientScaler::disabled().has_overflow(&half).unwrap());
    }

    #[test]
    fn per_step_divides_by_world_only() {
        let sync = GradientSynchronizer::new(SyncMode::PerStep, 4);
        assert_eq!(sync.loss_divisor(), 4);
        let reduced = sync
            .reduce(&SingleProcess, vec![Tensor::new(&[3f32, 5.0], &Device::Cpu).unwrap()])
            .unwrap();
        assert_eq!(reduced[0].to_vec1::<f32>().unwrap(), vec![3.0, 5.0]);
    }

    #[test]
    fn steps_optimizer_once_on_finite_gradients() {
        let param = var(&[1.0, 1.0]);
        let mut optimizer = optimizer_for(std::slice::from_ref(&param));
        let mut scaler = GradientScaler::disabled();
        let mut accumulator = GradientAccumulator::new([&param]);
        let mut counters = StepCounters::default();
        let sync = GradientSynchronizer::new(SyncMode::PostAccumulation, 1);

        accumulator.accumulate(&backward(&param, &[1.0, -1.0])).unwrap();
        let outcome = sync
            .step(&SingleProcess, &mut accumulator, &mut optimizer, &mut scaler, &mut counters)
            .unwrap();

        assert!(outcome.stepped && !outcome.overflow);
        assert_eq!(counters, StepCounters { global_step: 1, skipped_steps: 0 });
        assert_eq!(optimizer.step_count(), 1);
        let values = param.as_tensor().to_vec1::<f32>().unwrap();
        assert!(values[0] < 1.0 && values[1] > 1.0);
    }

    #[test]
    fn nan_gradient_skips_update_and_keeps_parameters() {
        let param = var(&[0.25, -4.0, 7.5]);
        let before = param.as_tensor().to_vec1::<f32>().unwrap();
        let mut optimizer = optimizer_for(std::slice::from_ref(&param));
        let mut scaler = GradientScaler::with_config(Some(LossScaleConfig {
            initial_scale: 1024.0,
            ..LossScaleConfig::default()
        }));
        let mut accumulator = GradientAccumulator::new([&param]);
        let mut counters = StepCounters {
            global_step: 3,
            skipped_steps: 1,
        };
        let sync = GradientSynchronizer::new(SyncMode::PostAccumulation, 1);

        accumulator
            .accumulate(&backward(&param, &[1.0, f32::NAN, 0.0]))
            .unwrap();
        let outcome = sync
            .step(&SingleProcess, &mut accumulator, &mut optimizer, &mut scaler, &mut counters)
            .unwrap();

        assert!(outcome.overflow && !outcome.stepped);
        assert_eq!(counters, StepCounters { global_step: 3, skipped_steps: 2 });
        assert_eq!(outcome.loss_scale, 512.0);
        assert_eq!(optimizer.step_count(), 0);
        let after = param.as_tensor().to_vec1::<f32>().unwrap();
        assert_eq!(
            before.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            after.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
        assert!(!accumulator.has_gradients());
    }

    #[test]
    fn overflow_on_one_rank_skips_everywhere() {
        let groups = ThreadGroup::new(2);
        let outcomes: Vec<(SyncOutcome, StepCounters)> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .iter()
                .map(|group| {
                    scope.spawn(move || {
                        let param = var(&[1.0]);
                        let mut optimizer = optimizer_for(std::slice::from_ref(&param));
                        let mut scaler = GradientScaler::disabled();
                        let mut accumulator = GradientAccumulator::new([&param]);
                        let mut counters = StepCounters::default();
                        let coeff = if group.rank() == 1 { f32::INFINITY } else { 1.0 };
                        accumulator.accumulate(&backward(&param, &[coeff])).unwrap();
                        let sync = GradientSynchronizer::new(SyncMode::PostAccumulation, 1);
                        let outcome = sync
                            .step(group, &mut accumulator, &mut optimizer, &mut scaler, &mut counters)
                            .unwrap();
                        (outcome, counters)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (outcome, counters) in outcomes {
            assert!(outcome.overflow);
            assert_eq!(counters.global_step, 0);
            assert_eq!(counters.skipped_steps, 1);
        }
    }
}
