use std::collections::HashMap;

pub mod scaler;

pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig, OverflowBuffer};

use candle_core::{DType, Tensor, Var};

use crate::{config, error::to_runtime_error, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub enum OptimizerSettings {
    Lamb(AdamConfig),
    AdamW(AdamConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    /// Gradients are rescaled so their global L2 norm does not exceed this.
    pub max_grad_norm: Option<f64>,
}

impl From<&config::OptimizerConfig> for OptimizerSettings {
    fn from(value: &config::OptimizerConfig) -> Self {
        let cfg = AdamConfig {
            learning_rate: value.learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
            max_grad_norm: value.max_grad_norm,
        };
        match value.algorithm {
            config::OptimizerType::Lamb => OptimizerSettings::Lamb(cfg),
            config::OptimizerType::AdamW => OptimizerSettings::AdamW(cfg),
        }
    }
}

impl OptimizerSettings {
    fn adam(&self) -> &AdamConfig {
        match self {
            OptimizerSettings::Lamb(cfg) | OptimizerSettings::AdamW(cfg) => cfg,
        }
    }

    fn adam_mut(&mut self) -> &mut AdamConfig {
        match self {
            OptimizerSettings::Lamb(cfg) | OptimizerSettings::AdamW(cfg) => cfg,
        }
    }
}

/// LAMB or AdamW over a fixed, ordered parameter list. Gradients are passed
/// in the same order as the parameters.
#[derive(Debug)]
pub struct TrainerOptimizer {
    settings: OptimizerSettings,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

/// Moments and step count, keyed by parameter name.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterMoments>,
}

#[derive(Debug, Clone)]
pub struct ParameterMoments {
    pub name: String,
    pub exp_avg: Tensor,
    pub exp_avg_sq: Tensor,
}

impl TrainerOptimizer {
    /// `no_decay` holds substrings; matching parameter names get no weight decay.
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        settings: OptimizerSettings,
        no_decay: &[String],
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer expects f32 parameters, '{}' is {:?}",
                    name,
                    tensor.dtype()
                )));
            }
            let first_moment = tensor.zeros_like().map_err(to_runtime_error)?;
            let second_moment = tensor.zeros_like().map_err(to_runtime_error)?;
            let apply_weight_decay = should_apply_weight_decay(&name, no_decay);
            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        Ok(Self {
            settings,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.settings.adam().learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.settings.adam_mut().learning_rate = lr;
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn parameters(&self) -> impl Iterator<Item = (&str, &Var)> {
        self.params
            .iter()
            .map(|slot| (slot.name.as_str(), &slot.param))
    }

    pub fn decays(&self, name: &str) -> Option<bool> {
        self.params
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.apply_weight_decay)
    }

    pub fn step(&mut self, grads: &[Tensor]) -> Result<(), TrainingError> {
        if grads.len() != self.params.len() {
            return Err(TrainingError::runtime(format!(
                "optimizer received {} gradients for {} parameters",
                grads.len(),
                self.params.len()
            )));
        }

        let cfg = *self.settings.adam();
        let mut grads: Vec<Tensor> = grads
            .iter()
            .map(|grad| grad.to_dtype(DType::F32))
            .collect::<candle_core::Result<_>>()
            .map_err(to_runtime_error)?;

        if let Some(max_norm) = cfg.max_grad_norm {
            let mut total_norm_sq = 0f64;
            for grad in &grads {
                let norm = tensor_l2_norm(grad)?;
                total_norm_sq += norm * norm;
            }
            let total_norm = total_norm_sq.sqrt();
            if total_norm > max_norm {
                let scale = max_norm / (total_norm + EPS);
                for grad in &mut grads {
                    *grad = grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                }
            }
        }

        self.step += 1;
        let lamb = matches!(self.settings, OptimizerSettings::Lamb(_));
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (slot, grad) in self.params.iter_mut().zip(grads) {
            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .and_then(|m| m.add(&grad.affine(1.0 - cfg.beta1, 0.0)?))
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .and_then(|v| v.add(&grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?))
                .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let adam_update = m_hat.div(&denom).map_err(to_runtime_error)?;

            let base = slot.param.as_tensor().clone();
            let weight_decay = if slot.apply_weight_decay {
                cfg.weight_decay
            } else {
                0.0
            };

            let next = if lamb {
                let update = if weight_decay != 0.0 {
                    adam_update
                        .add(&base.affine(weight_decay, 0.0).map_err(to_runtime_error)?)
                        .map_err(to_runtime_error)?
                } else {
                    adam_update
                };
                let weight_norm = tensor_l2_norm(&base)?;
                let update_norm = tensor_l2_norm(&update)?;
                let trust_ratio = if weight_norm > 0.0 && update_norm > 0.0 {
                    weight_norm / update_norm
                } else {
                    1.0
                };
                let delta = update
                    .affine(cfg.learning_rate * trust_ratio, 0.0)
                    .map_err(to_runtime_error)?;
                base.sub(&delta).map_err(to_runtime_error)?
            } else {
                let decayed = if weight_decay != 0.0 {
                    base.affine(1.0 - cfg.learning_rate * weight_decay, 0.0)
                        .map_err(to_runtime_error)?
                } else {
                    base
                };
                let delta = adam_update
                    .affine(cfg.learning_rate, 0.0)
                    .map_err(to_runtime_error)?;
                decayed.sub(&delta).map_err(to_runtime_error)?
            };

            slot.param.set(&next).map_err(to_runtime_error)?;
            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            step: self.step,
            parameters: self
                .params
                .iter()
                .map(|slot| ParameterMoments {
                    name: slot.name.clone(),
                    exp_avg: slot.first_moment.clone(),
                    exp_avg_sq: slot.second_moment.clone(),
                })
                .collect(),
        }
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|moments| (moments.name.clone(), moments))
            .collect();

        for slot in &mut self.params {
            let moments = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;
            let dims = slot.param.as_tensor().dims();
            if moments.exp_avg.dims() != dims || moments.exp_avg_sq.dims() != dims {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let device = slot.param.as_tensor().device();
            slot.first_moment = moments
                .exp_avg
                .to_dtype(DType::F32)
                .and_then(|t| t.to_device(device))
                .map_err(to_runtime_error)?;
            slot.second_moment = moments
                .exp_avg_sq
                .to_dtype(DType::F32)
                .and_then(|t| t.to_device(device))
                .map_err(to_runtime_error)?;
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        self.step = state.step;
        Ok(())
    }
}

fn should_apply_weight_decay(name: &str, exclusions: &[String]) -> bool {
    !exclusions
        .iter()
        .any(|pattern| !pattern.is_empty() && name.contains(pattern.as_str()))
}

pub(crate) fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let value = tensor
        .sqr()
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn var(name: &str, values: &[f32]) -> (String, Var) {
        let tensor = Tensor::from_slice(values, values.len(), &Device::Cpu).unwrap();
        (name.to_string(), Var::from_tensor(&tensor).unwrap())
    }

    fn grad(values: &[f32]) -> Tensor {
        Tensor::from_slice(values, values.len(), &Device::Cpu).unwrap()
    }

    fn settings(lamb: bool, weight_decay: f64) -> OptimizerSettings {
        let cfg = AdamConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-6,
            weight_decay,
            max_grad_norm: None,
        };
        if lamb {
            OptimizerSettings::Lamb(cfg)
        } else {
            OptimizerSettings::AdamW(cfg)
        }
    }

    fn no_decay() -> Vec<String> {
        vec!["bias".into(), "LayerNorm".into()]
    }

    #[test]
    fn excludes_bias_and_norm_from_decay() {
        let optimizer = TrainerOptimizer::new(
            vec![
                var("bert.encoder.layer.0.output.dense.bias", &[0.0]),
                var("bert.encoder.layer.0.output.LayerNorm.weight", &[1.0]),
                var("bert.encoder.layer.0.output.dense.weight", &[1.0]),
            ],
            settings(true, 0.01),
            &no_decay(),
        )
        .unwrap();
        assert_eq!(optimizer.decays("bert.encoder.layer.0.output.dense.bias"), Some(false));
        assert_eq!(
            optimizer.decays("bert.encoder.layer.0.output.LayerNorm.weight"),
            Some(false)
        );
        assert_eq!(optimizer.decays("bert.encoder.layer.0.output.dense.weight"), Some(true));
    }

    #[test]
    fn adamw_first_step_moves_by_learning_rate() {
        let (name, param) = var("w", &[1.0, -1.0]);
        let mut optimizer =
            TrainerOptimizer::new(vec![(name, param.clone())], settings(false, 0.0), &[]).unwrap();
        optimizer.step(&[grad(&[0.5, -2.0])]).unwrap();
        let values = param.as_tensor().to_vec1::<f32>().unwrap();
        assert!((values[0] - 0.9).abs() < 1e-4);
        assert!((values[1] + 0.9).abs() < 1e-4);
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn lamb_scales_update_by_trust_ratio() {
        let (name, param) = var("w", &[3.0, 4.0]);
        let mut optimizer =
            TrainerOptimizer::new(vec![(name, param.clone())], settings(true, 0.0), &[]).unwrap();
        optimizer.step(&[grad(&[1.0, 1.0])]).unwrap();
        // First Adam update is ~[1, 1] (norm sqrt 2); weight norm is 5.
        let values = param.as_tensor().to_vec1::<f32>().unwrap();
        let expected_delta = 0.1 * 5.0 / 2f32.sqrt();
        assert!((values[0] - (3.0 - expected_delta)).abs() < 1e-3);
        assert!((values[1] - (4.0 - expected_delta)).abs() < 1e-3);
    }

    #[test]
    fn rejects_mismatched_gradient_count() {
        let mut optimizer =
            TrainerOptimizer::new(vec![var("w", &[1.0])], settings(true, 0.0), &[]).unwrap();
        assert!(optimizer.step(&[]).is_err());
    }

    #[test]
    fn state_round_trips_through_load() {
        let (name, param) = var("w", &[1.0, 2.0]);
        let mut optimizer =
            TrainerOptimizer::new(vec![(name.clone(), param.clone())], settings(false, 0.0), &[])
                .unwrap();
        optimizer.step(&[grad(&[0.1, 0.2])]).unwrap();
        let state = optimizer.state();

        let mut restored =
            TrainerOptimizer::new(vec![(name, param)], settings(false, 0.0), &[]).unwrap();
        restored.load_state(state.clone()).unwrap();
        assert_eq!(restored.step_count(), 1);
        let restored_state = restored.state();
        assert_eq!(
            restored_state.parameters[0].exp_avg.to_vec1::<f32>().unwrap(),
            state.parameters[0].exp_avg.to_vec1::<f32>().unwrap()
        );
    }
}
