//! Dynamic loss scaling for reduced-precision training.
//!
//! The scale only moves at macro-step boundaries, from the overflow verdict
//! every participant agreed on. Overflow detection itself runs whether or
//! not scaling is enabled, since an fp32 run can still produce NaN
//! gradients that must not reach the optimizer.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{error::to_runtime_error, TrainingError};

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(20),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

impl LossScaleConfig {
    /// Replaces out-of-range factors with usable ones. Growth and backoff of
    /// exactly 1.0 are kept, which pins the scale (static loss scaling).
    fn normalized(mut self) -> Self {
        self.growth_factor = self.growth_factor.max(1.0);
        if !(self.backoff_factor > 0.0 && self.backoff_factor <= 1.0) {
            self.backoff_factor = 0.5;
        }
        self.growth_interval = self.growth_interval.max(1);
        if self.min_scale <= 0.0 {
            self.min_scale = 1.0;
        }
        self.max_scale = self.max_scale.max(self.min_scale);
        self.initial_scale = self.initial_scale.clamp(self.min_scale, self.max_scale);
        self
    }
}

/// Overflow flag produced by the gradient check of one macro-step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverflowBuffer {
    found: bool,
}

impl OverflowBuffer {
    pub fn new(found: bool) -> Self {
        Self { found }
    }

    pub fn found(&self) -> bool {
        self.found
    }

    pub fn set(&mut self, found: bool) {
        self.found = found;
    }
}

/// Serializable view of the dynamic scale, stored in checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientScalerState {
    pub loss_scale: f32,
    pub stable_steps: usize,
}

#[derive(Debug, Clone)]
struct DynamicScale {
    config: LossScaleConfig,
    value: f32,
    /// Overflow-free updates since the scale last moved.
    stable_steps: usize,
}

impl DynamicScale {
    fn observe(&mut self, overflow: bool) {
        if overflow {
            self.value = (self.value * self.config.backoff_factor).max(self.config.min_scale);
            self.stable_steps = 0;
            return;
        }
        self.stable_steps += 1;
        if self.stable_steps == self.config.growth_interval {
            self.value = (self.value * self.config.growth_factor).min(self.config.max_scale);
            self.stable_steps = 0;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GradientScaler {
    dynamic: Option<DynamicScale>,
    overflow: OverflowBuffer,
}

impl GradientScaler {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// `None` keeps gradients unscaled, as for full-precision training.
    pub fn with_config(config: Option<LossScaleConfig>) -> Self {
        let dynamic = config.map(|config| {
            let config = config.normalized();
            DynamicScale {
                value: config.initial_scale,
                stable_steps: 0,
                config,
            }
        });
        Self {
            dynamic,
            overflow: OverflowBuffer::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.dynamic.is_some()
    }

    pub fn loss_scale(&self) -> f32 {
        self.dynamic.as_ref().map_or(1.0, |dynamic| dynamic.value)
    }

    pub fn overflow_buffer(&self) -> OverflowBuffer {
        self.overflow
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        self.multiply(tensor, f64::from(self.loss_scale()))
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        self.multiply(tensor, 1.0 / f64::from(self.loss_scale()))
    }

    fn multiply(&self, tensor: &Tensor, factor: f64) -> Result<Tensor, TrainingError> {
        if self.dynamic.is_none() {
            return Ok(tensor.clone());
        }
        tensor.affine(factor, 0.0).map_err(to_runtime_error)
    }

    /// True when any tensor holds an infinity or NaN.
    pub fn has_overflow<I>(&self, tensors: I) -> Result<bool, TrainingError>
    where
        I: IntoIterator,
        I::Item: AsRef<Tensor>,
    {
        for tensor in tensors {
            if !is_finite(tensor.as_ref())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Moves the scale according to `buffer` and returns its overflow flag.
    /// The scaler's own buffer is untouched.
    pub fn update_with_buffer(&mut self, buffer: OverflowBuffer) -> bool {
        let found = buffer.found();
        if let Some(dynamic) = self.dynamic.as_mut() {
            dynamic.observe(found);
        }
        found
    }

    pub fn state(&self) -> Option<GradientScalerState> {
        self.dynamic.as_ref().map(|dynamic| GradientScalerState {
            loss_scale: dynamic.value,
            stable_steps: dynamic.stable_steps,
        })
    }

    /// Restores a saved scale, clamped to this run's bounds. Ignored when
    /// scaling is disabled.
    pub fn load_state(&mut self, saved: GradientScalerState) {
        if let Some(dynamic) = self.dynamic.as_mut() {
            dynamic.value = saved
                .loss_scale
                .clamp(dynamic.config.min_scale, dynamic.config.max_scale);
            dynamic.stable_steps = saved.stable_steps.min(dynamic.config.growth_interval - 1);
        }
    }
}

/// A plain sum propagates both NaN and infinity, and cannot overflow for
/// finite f32 gradients the way a sum of squares can.
fn is_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(true);
    }
    let total = tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok(total.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn grads(values: &[f32]) -> Tensor {
        Tensor::from_slice(values, values.len(), &Device::Cpu).unwrap()
    }

    fn dynamic(initial_scale: f32, growth_interval: usize) -> GradientScaler {
        GradientScaler::with_config(Some(LossScaleConfig {
            initial_scale,
            growth_interval,
            ..LossScaleConfig::default()
        }))
    }

    #[test]
    fn clean_boundaries_grow_the_scale_once_per_interval() {
        let mut scaler = dynamic(512.0, 3);
        let clean = OverflowBuffer::default();
        for _ in 0..2 {
            assert!(!scaler.update_with_buffer(clean));
        }
        assert_eq!(scaler.loss_scale(), 512.0);
        assert!(!scaler.update_with_buffer(clean));
        assert_eq!(scaler.loss_scale(), 1024.0);
        assert_eq!(scaler.state().unwrap().stable_steps, 0);
    }

    #[test]
    fn overflow_buffer_backs_off_and_restarts_the_interval() {
        let mut scaler = dynamic(1024.0, 2);
        assert!(!scaler.update_with_buffer(OverflowBuffer::new(false)));
        assert!(scaler.update_with_buffer(OverflowBuffer::new(true)));
        assert_eq!(scaler.loss_scale(), 512.0);

        // The clean step before the overflow no longer counts towards growth.
        scaler.update_with_buffer(OverflowBuffer::new(false));
        assert_eq!(scaler.loss_scale(), 512.0);
        scaler.update_with_buffer(OverflowBuffer::new(false));
        assert_eq!(scaler.loss_scale(), 1024.0);
    }

    #[test]
    fn backoff_stops_at_min_scale() {
        let mut scaler = GradientScaler::with_config(Some(LossScaleConfig {
            initial_scale: 4.0,
            backoff_factor: 0.25,
            min_scale: 2.0,
            ..LossScaleConfig::default()
        }));
        for _ in 0..3 {
            scaler.update_with_buffer(OverflowBuffer::new(true));
        }
        assert_eq!(scaler.loss_scale(), 2.0);
    }

    #[test]
    fn static_scale_never_moves() {
        let mut scaler = GradientScaler::with_config(Some(LossScaleConfig {
            initial_scale: 128.0,
            growth_factor: 1.0,
            backoff_factor: 1.0,
            growth_interval: 1,
            ..LossScaleConfig::default()
        }));
        scaler.update_with_buffer(OverflowBuffer::new(true));
        scaler.update_with_buffer(OverflowBuffer::new(false));
        assert_eq!(scaler.loss_scale(), 128.0);
    }

    #[test]
    fn full_precision_run_still_reports_non_finite_gradients() {
        let scaler = GradientScaler::disabled();
        let finite = grads(&[3.0e38, -3.0e38, 1.0]);
        let nan = grads(&[0.5, f32::NAN]);
        let negative_inf = grads(&[f32::NEG_INFINITY]);
        let empty = grads(&[]);
        assert!(!scaler.has_overflow([&finite, &empty]).unwrap());
        assert!(scaler.has_overflow([&finite, &nan]).unwrap());
        assert!(scaler.has_overflow(vec![negative_inf]).unwrap());
    }

    #[test]
    fn disabled_scaler_passes_tensors_through_and_never_scales() {
        let mut scaler = GradientScaler::with_config(None);
        assert!(!scaler.is_enabled());
        assert!(scaler.state().is_none());

        assert!(scaler.update_with_buffer(OverflowBuffer::new(true)));
        assert_eq!(scaler.loss_scale(), 1.0);
        scaler.load_state(GradientScalerState {
            loss_scale: 64.0,
            stable_steps: 1,
        });
        assert_eq!(scaler.loss_scale(), 1.0);

        let tensor = grads(&[2.0, 4.0]);
        assert_eq!(scaler.scale(&tensor).unwrap().to_vec1::<f32>().unwrap(), vec![2.0, 4.0]);
        assert_eq!(scaler.unscale(&tensor).unwrap().to_vec1::<f32>().unwrap(), vec![2.0, 4.0]);
    }

    #[test]
    fn own_buffer_is_untouched_by_updates() {
        let mut scaler = dynamic(64.0, 2000);
        let before = scaler.overflow_buffer();

        assert!(scaler.update_with_buffer(OverflowBuffer::new(true)));
        assert_eq!(scaler.loss_scale(), 32.0);
        assert_eq!(scaler.overflow_buffer(), before);

        assert!(!scaler.update_with_buffer(OverflowBuffer::new(false)));
        assert_eq!(scaler.overflow_buffer(), before);
    }

    #[test]
    fn scaled_then_unscaled_gradient_is_unchanged() {
        let scaler = dynamic(1024.0, 2000);
        let tensor = grads(&[0.125, -3.0]);
        let scaled = scaler.scale(&tensor).unwrap();
        assert_eq!(scaled.to_vec1::<f32>().unwrap(), vec![128.0, -3072.0]);
        let back = scaler.unscale(&scaled).unwrap();
        assert_eq!(back.to_vec1::<f32>().unwrap(), vec![0.125, -3.0]);
    }

    #[test]
    fn state_restores_scale_within_bounds() {
        let mut scaler = GradientScaler::with_config(Some(LossScaleConfig::default()));
        scaler.load_state(GradientScalerState {
            loss_scale: 4096.0,
            stable_steps: 7,
        });
        assert_eq!(
            scaler.state(),
            Some(GradientScalerState {
                loss_scale: 4096.0,
                stable_steps: 7
            })
        );

        scaler.load_state(GradientScalerState {
            loss_scale: 2f32.powi(30),
            stable_steps: 0,
        });
        assert_eq!(scaler.loss_scale(), 2f32.powi(24));
    }
}
