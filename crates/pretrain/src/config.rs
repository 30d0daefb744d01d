use std::{
    fs,
    path::{Path, PathBuf},
};

use bert::{BertConfig, DEFAULT_HOOKED_MODULES};
use serde::{Deserialize, Serialize};

use crate::{optimizer::LossScaleConfig, TrainingError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub precision: PrecisionConfig,
    #[serde(default)]
    pub compute_drop: ComputeDropConfig,
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
}

/// Values derived once from the configuration and the dataset metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTraining {
    /// Examples per micro-step on one participant.
    pub micro_batch_size: usize,
    /// Micro-steps per macro-step.
    pub accumulation_steps: usize,
    pub avg_seq_per_pack: f64,
    pub steps_this_run: usize,
    pub sync_mode: SyncMode,
    pub log_dir: PathBuf,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.config_file.is_none() && self.model.bert.is_none() {
            errors.push("model must provide either `config_file` or an inline `bert` table".to_string());
        }

        if self.data.gradient_accumulation_steps < 1 {
            errors.push(format!(
                "Invalid gradient_accumulation_steps parameter: {}, should be >= 1",
                self.data.gradient_accumulation_steps
            ));
        } else if self.data.train_batch_size % self.data.gradient_accumulation_steps != 0 {
            errors.push(format!(
                "Invalid gradient_accumulation_steps parameter: {}, batch size {} should be divisible",
                self.data.gradient_accumulation_steps, self.data.train_batch_size
            ));
        }

        if self.data.train_batch_size == 0 {
            errors.push("data.train_batch_size must be greater than 0".to_string());
        }

        if self.data.max_seq_length == 0 {
            errors.push("data.max_seq_length must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if !(0.0..1.0).contains(&self.scheduler.warmup_proportion) {
            errors.push("scheduler.warmup_proportion must be in [0, 1)".to_string());
        }

        if self.runtime.max_steps == 0 {
            errors.push("runtime.max_steps must be greater than 0".to_string());
        }

        if self.runtime.log_freq == 0 {
            errors.push("runtime.log_freq must be greater than 0".to_string());
        }

        if self.runtime.num_steps_per_checkpoint == 0 {
            errors.push("runtime.num_steps_per_checkpoint must be greater than 0".to_string());
        }

        if self.runtime.keep_checkpoints == 0 {
            errors.push("runtime.keep_checkpoints must be greater than 0".to_string());
        }

        if self.compute_drop.event_sync_delay == 0 {
            errors.push("compute_drop.event_sync_delay must be greater than 0".to_string());
        }

        if let Some(scale) = self.precision.static_loss_scale {
            if scale <= 0.0 {
                errors.push("precision.static_loss_scale must be greater than 0".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }

    /// Resolves per-participant batch geometry. `avg_seq_per_pack` is 1.0 for
    /// unpacked data.
    pub fn resolve(&self, avg_seq_per_pack: f64) -> ResolvedTraining {
        let configured = self.data.gradient_accumulation_steps.max(1);
        let micro_batch_size = self.data.train_batch_size / configured;
        let accumulation_steps = if self.data.enable_packed_data_mode && avg_seq_per_pack > 0.0 {
            ((configured as f64 / avg_seq_per_pack).round() as usize).max(1)
        } else {
            configured
        };
        let sync_mode = if accumulation_steps > 1 && self.distributed.allreduce_post_accumulation {
            SyncMode::PostAccumulation
        } else {
            SyncMode::PerStep
        };
        ResolvedTraining {
            micro_batch_size,
            accumulation_steps,
            avg_seq_per_pack,
            steps_this_run: self.runtime.steps_this_run.unwrap_or(self.runtime.max_steps),
            sync_mode,
            log_dir: self
                .runtime
                .log_dir
                .clone()
                .unwrap_or_else(|| self.runtime.output_dir.clone()),
        }
    }

    /// Rejects a fresh run whose output directory already holds checkpoints,
    /// then makes sure the directory exists.
    pub fn prepare_output_dir(&self, create: bool) -> Result<(), TrainingError> {
        let dir = &self.runtime.output_dir;
        if !self.runtime.resume_from_checkpoint && dir.is_dir() {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if entry.file_name().to_string_lossy().starts_with("ckpt") {
                    return Err(TrainingError::validation(vec![format!(
                        "Output directory ({}) already exists and is not empty.",
                        dir.display()
                    )]));
                }
            }
        }
        if create {
            fs::create_dir_all(dir)?;
            if let Some(log_dir) = &self.runtime.log_dir {
                fs::create_dir_all(log_dir)?;
            }
        }
        Ok(())
    }

    pub fn bert_config(&self) -> Result<BertConfig, TrainingError> {
        match (&self.model.bert, &self.model.config_file) {
            (Some(inline), _) => {
                let config = inline.clone().padded_vocab();
                config.validate()?;
                Ok(config)
            }
            (None, Some(path)) => Ok(BertConfig::from_json_file(path)?),
            (None, None) => Err(TrainingError::initialization(
                "no model configuration provided",
            )),
        }
    }

    pub fn loss_scale(&self) -> Option<LossScaleConfig> {
        if !self.precision.mode.uses_loss_scaling() {
            return None;
        }
        let mut config = LossScaleConfig {
            initial_scale: self.precision.init_loss_scale,
            growth_interval: self.precision.growth_interval,
            ..LossScaleConfig::default()
        };
        if let Some(scale) = self.precision.static_loss_scale {
            config.initial_scale = scale;
            config.growth_factor = 1.0;
            config.backoff_factor = 1.0;
        }
        Some(config)
    }

    fn apply_base_path(&mut self, base: &Path) {
        if let Some(path) = self.model.config_file.as_mut() {
            absolutize_in_place(path, base);
        }
        absolutize_in_place(&mut self.data.input_dir, base);
        absolutize_in_place(&mut self.runtime.output_dir, base);
        if let Some(path) = self.runtime.log_dir.as_mut() {
            absolutize_in_place(path, base);
        }
        if let Some(path) = self.runtime.init_checkpoint.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub config_file: Option<PathBuf>,
    #[serde(default)]
    pub bert: Option<BertConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub input_dir: PathBuf,
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,
    #[serde(default = "default_max_predictions_per_seq")]
    pub max_predictions_per_seq: usize,
    /// Examples per participant per macro-step, before division by the
    /// accumulation factor.
    #[serde(default = "default_train_batch_size")]
    pub train_batch_size: usize,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
    #[serde(default)]
    pub enable_packed_data_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: Option<f64>,
    #[serde(default = "default_no_decay")]
    pub no_decay: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_epsilon(),
            max_grad_norm: default_max_grad_norm(),
            no_decay: default_no_decay(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    #[default]
    Lamb,
    AdamW,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_warmup_proportion")]
    pub warmup_proportion: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            warmup_proportion: default_warmup_proportion(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecisionConfig {
    #[serde(default)]
    pub mode: Precision,
    #[serde(default = "default_init_loss_scale")]
    pub init_loss_scale: f32,
    /// Fixed loss scale; dynamic scaling when absent.
    #[serde(default)]
    pub static_loss_scale: Option<f32>,
    #[serde(default = "default_growth_interval")]
    pub growth_interval: usize,
}

impl Default for PrecisionConfig {
    fn default() -> Self {
        Self {
            mode: Precision::default(),
            init_loss_scale: default_init_loss_scale(),
            static_loss_scale: None,
            growth_interval: default_growth_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
    Mixed,
}

impl Precision {
    pub fn uses_loss_scaling(self) -> bool {
        matches!(self, Precision::Fp16 | Precision::Bf16 | Precision::Mixed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeDropConfig {
    /// Wall-clock budget per macro-step in seconds. Non-positive disables dropping.
    #[serde(default = "default_compute_threshold")]
    pub compute_threshold: f64,
    #[serde(default)]
    pub debug: bool,
    /// How many device markers the step clock keeps in flight before blocking.
    #[serde(default = "default_event_sync_delay")]
    pub event_sync_delay: usize,
    /// Dropping is armed only once the macro-step count exceeds this value.
    #[serde(default = "default_enable_after_step")]
    pub enable_after_step: usize,
    #[serde(default)]
    pub anchor: StepAnchor,
    #[serde(default = "default_hooked_modules")]
    pub hooked_modules: Vec<String>,
}

impl ComputeDropConfig {
    pub fn threshold_enabled(&self) -> bool {
        self.compute_threshold > 0.0
    }
}

impl Default for ComputeDropConfig {
    fn default() -> Self {
        Self {
            compute_threshold: default_compute_threshold(),
            debug: false,
            event_sync_delay: default_event_sync_delay(),
            enable_after_step: default_enable_after_step(),
            anchor: StepAnchor::default(),
            hooked_modules: default_hooked_modules(),
        }
    }
}

/// Which macro-step count the warmup guard compares against after a resume.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepAnchor {
    /// The global macro-step index, carried across resumes.
    #[default]
    Absolute,
    /// Macro-steps taken since this process started.
    Relative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub output_dir: PathBuf,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default)]
    pub steps_this_run: Option<usize>,
    #[serde(default = "default_log_freq")]
    pub log_freq: usize,
    #[serde(default = "default_num_steps_per_checkpoint")]
    pub num_steps_per_checkpoint: usize,
    #[serde(default)]
    pub skip_checkpoint: bool,
    #[serde(default = "default_keep_checkpoints")]
    pub keep_checkpoints: usize,
    #[serde(default)]
    pub resume_from_checkpoint: bool,
    #[serde(default)]
    pub resume_step: Option<usize>,
    #[serde(default)]
    pub init_checkpoint: Option<PathBuf>,
    #[serde(default)]
    pub phase2: bool,
    #[serde(default = "default_phase1_end_step")]
    pub phase1_end_step: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Defer gradient reduction to the macro-step boundary and reduce one
    /// flattened buffer.
    #[serde(default = "default_allreduce_post_accumulation")]
    pub allreduce_post_accumulation: bool,
    /// Round the flattened buffer through f16 for the reduction, trading
    /// precision and range for half the traffic. Overflow in f16 shows up as
    /// a skipped step.
    #[serde(default)]
    pub allreduce_fp16: bool,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            allreduce_post_accumulation: default_allreduce_post_accumulation(),
            allreduce_fp16: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Gradients accumulate locally and are reduced once as a flat buffer.
    PostAccumulation,
    /// Each gradient is reduced on its own; the loss is pre-divided by the
    /// accumulation factor.
    PerStep,
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_max_seq_length() -> usize {
    512
}

fn default_max_predictions_per_seq() -> usize {
    80
}

fn default_train_batch_size() -> usize {
    32
}

fn default_gradient_accumulation_steps() -> usize {
    1
}

fn default_learning_rate() -> f64 {
    5e-5
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_epsilon() -> f64 {
    1e-6
}

fn default_max_grad_norm() -> Option<f64> {
    Some(1.0)
}

fn default_no_decay() -> Vec<String> {
    ["bias", "gamma", "beta", "LayerNorm"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_warmup_proportion() -> f64 {
    0.01
}

fn default_init_loss_scale() -> f32 {
    2f32.powi(20)
}

fn default_growth_interval() -> usize {
    2000
}

fn default_compute_threshold() -> f64 {
    -1.0
}

fn default_event_sync_delay() -> usize {
    9
}

fn default_enable_after_step() -> usize {
    5
}

fn default_hooked_modules() -> Vec<String> {
    DEFAULT_HOOKED_MODULES.iter().map(|s| s.to_string()).collect()
}

fn default_seed() -> u64 {
    42
}

fn default_max_steps() -> usize {
    1000
}

fn default_log_freq() -> usize {
    1
}

fn default_num_steps_per_checkpoint() -> usize {
    100
}

fn default_keep_checkpoints() -> usize {
    3
}

fn default_phase1_end_step() -> usize {
    7038
}

fn default_allreduce_post_accumulation() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("pretrain.toml");
        fs::write(&path, body).unwrap();
        path
    }

    const MINIMAL: &str = r#"
[model.bert]
vocab_size = 30
hidden_size = 16
num_hidden_layers = 1
num_attention_heads = 2
intermediate_size = 32

[data]
input_dir = "shards"
train_batch_size = 8
gradient_accumulation_steps = 4

[runtime]
output_dir = "out"
"#;

    #[test]
    fn loads_toml_and_resolves_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), MINIMAL);
        let config = TrainingConfig::load(&path).unwrap();
        assert_eq!(config.data.input_dir, dir.path().join("shards"));
        assert_eq!(config.runtime.keep_checkpoints, 3);
        assert_eq!(config.compute_drop.event_sync_delay, 9);
        assert_eq!(config.bert_config().unwrap().vocab_size, 32);

        let resolved = config.resolve(1.0);
        assert_eq!(resolved.micro_batch_size, 2);
        assert_eq!(resolved.accumulation_steps, 4);
        assert_eq!(resolved.sync_mode, SyncMode::PostAccumulation);
        assert_eq!(resolved.steps_this_run, 1000);
        assert_eq!(resolved.log_dir, dir.path().join("out"));
    }

    #[test]
    fn rejects_indivisible_batch() {
        let dir = tempfile::tempdir().unwrap();
        let body = MINIMAL.replace("train_batch_size = 8", "train_batch_size = 6");
        let path = write_config(dir.path(), &body);
        match TrainingConfig::load(&path) {
            Err(TrainingError::Validation(messages)) => {
                assert!(messages[0].contains("should be divisible"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_accumulation() {
        let dir = tempfile::tempdir().unwrap();
        let body = MINIMAL.replace("gradient_accumulation_steps = 4", "gradient_accumulation_steps = 0");
        let path = write_config(dir.path(), &body);
        assert!(matches!(
            TrainingConfig::load(&path),
            Err(TrainingError::Validation(_))
        ));
    }

    #[test]
    fn packed_mode_rescales_accumulation() {
        let dir = tempfile::tempdir().unwrap();
        let body = MINIMAL.replace("gradient_accumulation_steps = 4", "gradient_accumulation_steps = 4\nenable_packed_data_mode = true");
        let config = TrainingConfig::load(write_config(dir.path(), &body)).unwrap();
        let resolved = config.resolve(2.0);
        assert_eq!(resolved.micro_batch_size, 2);
        assert_eq!(resolved.accumulation_steps, 2);
    }

    #[test]
    fn single_accumulation_forces_per_step_sync() {
        let dir = tempfile::tempdir().unwrap();
        let body = MINIMAL.replace("gradient_accumulation_steps = 4", "gradient_accumulation_steps = 1");
        let config = TrainingConfig::load(write_config(dir.path(), &body)).unwrap();
        assert_eq!(config.resolve(1.0).sync_mode, SyncMode::PerStep);
    }

    #[test]
    fn fresh_run_refuses_existing_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig::load(write_config(dir.path(), MINIMAL)).unwrap();
        config.prepare_output_dir(true).unwrap();
        fs::write(config.runtime.output_dir.join("ckpt_10.pt"), b"x").unwrap();
        assert!(config.prepare_output_dir(true).is_err());

        let mut resumed = config.clone();
        resumed.runtime.resume_from_checkpoint = true;
        resumed.prepare_output_dir(true).unwrap();
    }

    #[test]
    fn non_positive_threshold_disables_dropping() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig::load(write_config(dir.path(), MINIMAL)).unwrap();
        assert!(!config.compute_drop.threshold_enabled());

        let mut drop = config.compute_drop.clone();
        drop.compute_threshold = 0.0;
        assert!(!drop.threshold_enabled());
        drop.compute_threshold = 0.25;
        assert!(drop.threshold_enabled());
    }

    #[test]
    fn fp16_reduction_is_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig::load(write_config(dir.path(), MINIMAL)).unwrap();
        assert!(!config.distributed.allreduce_fp16);

        let body = format!("{MINIMAL}\n[distributed]\nallreduce_fp16 = true\n");
        let config = TrainingConfig::load(write_config(dir.path(), &body)).unwrap();
        assert!(config.distributed.allreduce_fp16);
        assert!(config.distributed.allreduce_post_accumulation);
    }

    #[test]
    fn loss_scaling_follows_precision() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TrainingConfig::load(write_config(dir.path(), MINIMAL)).unwrap();
        assert!(config.loss_scale().is_none());
        config.precision.mode = Precision::Fp16;
        assert_eq!(config.loss_scale().unwrap().initial_scale, 2f32.powi(20));
    }
}
