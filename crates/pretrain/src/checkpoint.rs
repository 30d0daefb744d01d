//! `ckpt_<step>.pt` files: model weights, optimizer moments and a JSON
//! manifest in one safetensors container.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{Device, Tensor, Var};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::{
    data::{DataCursor, ShardSchedule},
    optimizer::{GradientScaler, GradientScalerState, OptimizerState, ParameterMoments, TrainerOptimizer},
    sync::StepCounters,
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const MANIFEST_KEY: &str = "_manifest";
const MODEL_PREFIX: &str = "model.";
const EXP_AVG_PREFIX: &str = "optimizer.exp_avg.";
const EXP_AVG_SQ_PREFIX: &str = "optimizer.exp_avg_sq.";

/// Shard position and the epoch's file order, stored as one array whose
/// first element is the shard index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<Value>", try_from = "Vec<Value>")]
pub struct ShardList {
    pub shard_index: usize,
    pub files: Vec<PathBuf>,
}

impl From<ShardList> for Vec<Value> {
    fn from(list: ShardList) -> Self {
        std::iter::once(Value::from(list.shard_index))
            .chain(
                list.files
                    .into_iter()
                    .map(|path| Value::from(path.to_string_lossy().into_owned())),
            )
            .collect()
    }
}

impl TryFrom<Vec<Value>> for ShardList {
    type Error = String;

    fn try_from(values: Vec<Value>) -> Result<Self, Self::Error> {
        let mut values = values.into_iter();
        let shard_index = values
            .next()
            .and_then(|value| value.as_u64())
            .ok_or_else(|| "file list must start with a shard index".to_string())?;
        let files = values
            .map(|value| {
                value
                    .as_str()
                    .map(PathBuf::from)
                    .ok_or_else(|| format!("file list entry {value} is not a path"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            shard_index: shard_index as usize,
            files,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub global_step: usize,
    pub skipped_steps: usize,
    pub epoch: usize,
    pub files: ShardList,
    pub data_cursor: DataCursor,
    pub scaler: Option<GradientScalerState>,
    pub optimizer_step: usize,
}

impl CheckpointManifest {
    pub fn counters(&self) -> StepCounters {
        StepCounters {
            global_step: self.global_step,
            skipped_steps: self.skipped_steps,
        }
    }

    pub fn schedule(&self) -> Result<ShardSchedule, TrainingError> {
        ShardSchedule::from_files(self.files.files.clone(), self.epoch)
    }
}

pub struct SaveRequest<'a> {
    pub output_dir: &'a Path,
    /// Step used in the file name; differs from the counters in phase 2.
    pub checkpoint_step: usize,
    pub config: &'a TrainingConfig,
    pub parameters: &'a [(String, Var)],
    pub optimizer: &'a TrainerOptimizer,
    pub scaler: &'a GradientScaler,
    pub counters: StepCounters,
    pub schedule: &'a ShardSchedule,
    pub cursor: DataCursor,
    pub max_keep: usize,
}

pub struct LoadedCheckpoint {
    pub path: PathBuf,
    pub manifest: CheckpointManifest,
    pub model: HashMap<String, Tensor>,
    pub optimizer: OptimizerState,
}

pub fn checkpoint_path(output_dir: &Path, step: usize) -> PathBuf {
    output_dir.join(format!("ckpt_{step}.pt"))
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<PathBuf, TrainingError> {
    fs::create_dir_all(request.output_dir).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create checkpoint directory {}: {err}",
            request.output_dir.display()
        ))
    })?;
    if request.parameters.is_empty() {
        return Err(TrainingError::checkpoint(
            "model contains no parameters to checkpoint",
        ));
    }

    let optimizer_state = request.optimizer.state();
    let mut tensors = HashMap::with_capacity(request.parameters.len() * 3 + 1);
    for (name, var) in request.parameters {
        tensors.insert(format!("{MODEL_PREFIX}{name}"), var.as_tensor().clone());
    }
    for moments in &optimizer_state.parameters {
        tensors.insert(format!("{EXP_AVG_PREFIX}{}", moments.name), moments.exp_avg.clone());
        tensors.insert(
            format!("{EXP_AVG_SQ_PREFIX}{}", moments.name),
            moments.exp_avg_sq.clone(),
        );
    }

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: fingerprint_config(request.config)?,
        global_step: request.counters.global_step,
        skipped_steps: request.counters.skipped_steps,
        epoch: request.schedule.epoch(),
        files: ShardList {
            shard_index: request.cursor.shard_index,
            files: request.schedule.files().to_vec(),
        },
        data_cursor: request.cursor,
        scaler: request.scaler.state(),
        optimizer_step: optimizer_state.step,
    };
    let manifest_bytes = serde_json::to_vec(&manifest).map_err(|err| {
        TrainingError::checkpoint(format!("failed to serialize manifest: {err}"))
    })?;
    let len = manifest_bytes.len();
    let manifest_tensor = Tensor::from_vec(manifest_bytes, len, &Device::Cpu)
        .map_err(|err| TrainingError::checkpoint(err.to_string()))?;
    tensors.insert(MANIFEST_KEY.to_string(), manifest_tensor);

    let path = checkpoint_path(request.output_dir, request.checkpoint_step);
    candle_core::safetensors::save(&tensors, &path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to write {}: {err}", path.display()))
    })?;
    info!(path = %path.display(), global_step = manifest.global_step, "saved checkpoint");

    prune_checkpoints(request.output_dir, request.max_keep)?;
    Ok(path)
}

pub fn load_checkpoint(path: &Path, device: &Device) -> Result<LoadedCheckpoint, TrainingError> {
    let mut tensors = candle_core::safetensors::load(path, device).map_err(|err| {
        TrainingError::checkpoint(format!("failed to read {}: {err}", path.display()))
    })?;
    let manifest = decode_manifest(&mut tensors, path)?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "unsupported checkpoint version {} (expected {})",
            manifest.version, CHECKPOINT_VERSION
        )));
    }

    let mut model = HashMap::new();
    let mut exp_avg = HashMap::new();
    let mut exp_avg_sq = HashMap::new();
    for (key, tensor) in tensors {
        if let Some(name) = key.strip_prefix(MODEL_PREFIX) {
            model.insert(name.to_string(), tensor);
        } else if let Some(name) = key.strip_prefix(EXP_AVG_SQ_PREFIX) {
            exp_avg_sq.insert(name.to_string(), tensor);
        } else if let Some(name) = key.strip_prefix(EXP_AVG_PREFIX) {
            exp_avg.insert(name.to_string(), tensor);
        }
    }

    let mut parameters = Vec::with_capacity(exp_avg.len());
    for (name, first) in exp_avg {
        let second = exp_avg_sq.remove(&name).ok_or_else(|| {
            TrainingError::checkpoint(format!("checkpoint is missing exp_avg_sq for {name}"))
        })?;
        parameters.push(ParameterMoments {
            name,
            exp_avg: first,
            exp_avg_sq: second,
        });
    }
    parameters.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(LoadedCheckpoint {
        path: path.to_path_buf(),
        optimizer: OptimizerState {
            step: manifest.optimizer_step,
            parameters,
        },
        manifest,
        model,
    })
}

/// Model tensors of a checkpoint, without reading its training state.
pub fn load_model_weights(
    path: &Path,
    device: &Device,
) -> Result<HashMap<String, Tensor>, TrainingError> {
    let tensors = candle_core::safetensors::load(path, device).map_err(|err| {
        TrainingError::checkpoint(format!("failed to read {}: {err}", path.display()))
    })?;
    Ok(tensors
        .into_iter()
        .filter_map(|(key, tensor)| {
            key.strip_prefix(MODEL_PREFIX)
                .map(|name| (name.to_string(), tensor))
        })
        .collect())
}

pub fn apply_model_weights(
    parameters: &[(String, Var)],
    mut weights: HashMap<String, Tensor>,
) -> Result<(), TrainingError> {
    for (name, var) in parameters {
        let tensor = weights.remove(name).ok_or_else(|| {
            TrainingError::checkpoint(format!("checkpoint missing parameter {name}"))
        })?;
        let desired = var.as_tensor();
        if tensor.dims() != desired.dims() {
            return Err(TrainingError::checkpoint(format!(
                "parameter {name} has shape {:?} in the checkpoint but {:?} in the model",
                tensor.dims(),
                desired.dims()
            )));
        }
        let tensor = tensor
            .to_dtype(desired.dtype())
            .and_then(|t| t.to_device(desired.device()))
            .map_err(|err| TrainingError::checkpoint(err.to_string()))?;
        var.set(&tensor)
            .map_err(|err| TrainingError::checkpoint(err.to_string()))?;
    }

    if !weights.is_empty() {
        let mut extra = weights.keys().cloned().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::checkpoint(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }
    Ok(())
}

/// Steps of every `ckpt_<n>.pt` in `dir`, ascending.
pub fn checkpoint_steps(dir: &Path) -> Result<Vec<(usize, PathBuf)>, TrainingError> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let step = name
            .strip_prefix("ckpt_")
            .and_then(|rest| rest.strip_suffix(".pt"))
            .and_then(|digits| digits.parse::<usize>().ok());
        if let Some(step) = step {
            if entry.file_type()?.is_file() {
                found.push((step, entry.path()));
            }
        }
    }
    found.sort();
    Ok(found)
}

pub fn latest_checkpoint_step(dir: &Path) -> Result<Option<usize>, TrainingError> {
    Ok(checkpoint_steps(dir)?.last().map(|(step, _)| *step))
}

/// Hash of the settings that shape training. Fields that only say where a
/// run starts are left out, so a resumed run matches the run it continues.
pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let mut config = config.clone();
    config.runtime.resume_from_checkpoint = false;
    config.runtime.resume_step = None;
    config.runtime.init_checkpoint = None;
    let json = serde_json::to_vec(&config)
        .map_err(|err| TrainingError::checkpoint(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn decode_manifest(
    tensors: &mut HashMap<String, Tensor>,
    path: &Path,
) -> Result<CheckpointManifest, TrainingError> {
    let tensor = tensors.remove(MANIFEST_KEY).ok_or_else(|| {
        TrainingError::checkpoint(format!("{} has no manifest", path.display()))
    })?;
    let bytes = tensor
        .to_device(&Device::Cpu)
        .and_then(|t| t.to_vec1::<u8>())
        .map_err(|err| TrainingError::checkpoint(err.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|err| {
        TrainingError::checkpoint(format!("invalid manifest in {}: {err}", path.display()))
    })
}

fn prune_checkpoints(dir: &Path, keep: usize) -> Result<(), TrainingError> {
    if keep == 0 {
        return Ok(());
    }
    let mut existing = checkpoint_steps(dir)?;
    while existing.len() > keep {
        let (_, victim) = existing.remove(0);
        fs::remove_file(&victim).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to prune checkpoint {}: {err}",
                victim.display()
            ))
        })?;
        info!(path = %victim.display(), "removed old checkpoint");
    }
    Ok(())
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
