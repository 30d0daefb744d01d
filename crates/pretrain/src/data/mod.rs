//! Pretraining shards: discovery, per-rank shard selection, sampling and
//! batch assembly.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use bert::PretrainingInputs;
use candle_core::{DType, Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{error::to_runtime_error, TrainingError};

pub mod packed;
pub mod prefetch;

pub use packed::{metadata_path, read_avg_seq_per_sample};
pub use prefetch::{PrefetchHandle, ShardPrefetcher};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

const UNPACKED_KEYS: [&str; 6] = [
    "input_ids",
    "input_mask",
    "segment_ids",
    "masked_lm_positions",
    "masked_lm_ids",
    "next_sentence_labels",
];

const PACKED_KEYS: [&str; 3] = ["positions", "next_sentence_positions", "next_sentence_weights"];

/// Settings shared by every shard of a run.
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub max_predictions_per_seq: usize,
    pub packed: bool,
    pub micro_batch_size: usize,
    pub seed: u64,
}

/// One micro-batch with its training targets.
#[derive(Debug, Clone)]
pub struct PretrainingBatch {
    pub inputs: PretrainingInputs,
    /// `[batch, seq]`, `-1` outside masked positions.
    pub masked_lm_labels: Tensor,
    /// `[batch]`, or `[batch, P]` for packed data.
    pub next_sentence_labels: Tensor,
}

impl PretrainingBatch {
    pub fn batch_size(&self) -> usize {
        self.inputs.batch_size()
    }

    pub fn sequence_length(&self) -> usize {
        self.inputs.sequence_length()
    }
}

/// Position of the data stream, stored in checkpoints. Only rank 0 writes
/// it, so it carries nothing rank specific: every participant derives its
/// own sample order from the run seed with [`order_seed`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataCursor {
    pub epoch: usize,
    pub shard_index: usize,
    /// Micro-batches already taken from the current shard.
    pub batch_index: usize,
}

/// The shuffled file list of one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSchedule {
    files: Vec<PathBuf>,
    epoch: usize,
}

impl ShardSchedule {
    /// Lists regular files under `input_dir`, sorts them and shuffles them
    /// with `seed + epoch`. Unpacked runs only accept names containing
    /// `training`.
    pub fn discover(input_dir: &Path, packed: bool, seed: u64, epoch: usize) -> Result<Self> {
        let entries = fs::read_dir(input_dir).map_err(|err| {
            TrainingError::data(format!(
                "failed to list input directory {}: {err}",
                input_dir.display()
            ))
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name();
            if packed || name.to_string_lossy().contains("training") {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(TrainingError::data(format!(
                "no training shards found in {}",
                input_dir.display()
            )));
        }

        files.sort();
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
        files.shuffle(&mut rng);
        Ok(Self { files, epoch })
    }

    pub fn from_files(files: Vec<PathBuf>, epoch: usize) -> Result<Self> {
        if files.is_empty() {
            return Err(TrainingError::data("shard list is empty"));
        }
        Ok(Self { files, epoch })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// File read by `rank` for `shard_index`. When there are more
    /// participants than files, the index is shifted each round so ranks
    /// rotate over the files.
    pub fn shard_for(&self, shard_index: usize, rank: usize, world_size: usize) -> &Path {
        let num_files = self.files.len();
        let position = if world_size > num_files {
            let remainder = world_size % num_files;
            shard_index * world_size + rank + remainder * shard_index
        } else {
            shard_index * world_size + rank
        };
        &self.files[position % num_files]
    }
}

/// Seed of the sample order inside one shard.
pub fn order_seed(seed: u64, rank: usize, epoch: usize, shard_index: usize) -> u64 {
    seed.wrapping_add(rank as u64)
        .wrapping_add(epoch as u64)
        .wrapping_add((shard_index as u64) << 20)
}

#[derive(Debug, Clone)]
struct Field {
    data: Vec<i64>,
    width: usize,
}

impl Field {
    fn from_tensors(tensors: &mut HashMap<String, Tensor>, key: &str, path: &Path) -> Result<Self> {
        let tensor = tensors.remove(key).ok_or_else(|| {
            TrainingError::data(format!("shard {} is missing '{key}'", path.display()))
        })?;
        let width = match tensor.dims() {
            [_] => 1,
            [_, width] => *width,
            dims => {
                return Err(TrainingError::data(format!(
                    "'{key}' in {} has unsupported shape {dims:?}",
                    path.display()
                )))
            }
        };
        let data = tensor
            .to_dtype(DType::I64)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<i64>())
            .map_err(to_runtime_error)?;
        Ok(Self { data, width })
    }

    fn rows(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.data.len() / self.width
        }
    }

    fn row(&self, index: usize) -> &[i64] {
        &self.data[index * self.width..(index + 1) * self.width]
    }
}

#[derive(Debug, Clone)]
struct PackedFields {
    positions: Field,
    next_sentence_positions: Field,
    next_sentence_weights: Field,
}

/// All samples of one shard, held on the host.
#[derive(Debug, Clone)]
pub struct PretrainingDataset {
    path: PathBuf,
    max_predictions_per_seq: usize,
    input_ids: Field,
    input_mask: Field,
    segment_ids: Field,
    masked_lm_positions: Field,
    masked_lm_ids: Field,
    next_sentence_labels: Field,
    packed: Option<PackedFields>,
}

impl PretrainingDataset {
    pub fn load(path: &Path, max_predictions_per_seq: usize, packed: bool) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(|err| {
            TrainingError::data(format!("failed to read shard {}: {err}", path.display()))
        })?;

        let [input_ids, input_mask, segment_ids, masked_lm_positions, masked_lm_ids, next_sentence_labels] =
            UNPACKED_KEYS.map(|key| Field::from_tensors(&mut tensors, key, path));
        let packed = if packed {
            let [positions, next_sentence_positions, next_sentence_weights] =
                PACKED_KEYS.map(|key| Field::from_tensors(&mut tensors, key, path));
            Some(PackedFields {
                positions: positions?,
                next_sentence_positions: next_sentence_positions?,
                next_sentence_weights: next_sentence_weights?,
            })
        } else {
            None
        };

        let dataset = Self {
            path: path.to_path_buf(),
            max_predictions_per_seq,
            input_ids: input_ids?,
            input_mask: input_mask?,
            segment_ids: segment_ids?,
            masked_lm_positions: masked_lm_positions?,
            masked_lm_ids: masked_lm_ids?,
            next_sentence_labels: next_sentence_labels?,
            packed,
        };
        dataset.check_rows()?;
        debug!(path = %path.display(), samples = dataset.len(), "loaded shard");
        Ok(dataset)
    }

    fn check_rows(&self) -> Result<()> {
        let rows = self.input_ids.rows();
        let mut fields = vec![
            ("input_mask", &self.input_mask),
            ("segment_ids", &self.segment_ids),
            ("masked_lm_positions", &self.masked_lm_positions),
            ("masked_lm_ids", &self.masked_lm_ids),
            ("next_sentence_labels", &self.next_sentence_labels),
        ];
        if let Some(packed) = &self.packed {
            fields.push(("positions", &packed.positions));
            fields.push(("next_sentence_positions", &packed.next_sentence_positions));
            fields.push(("next_sentence_weights", &packed.next_sentence_weights));
        }
        for (name, field) in fields {
            if field.rows() != rows {
                return Err(TrainingError::data(format!(
                    "shard {} has {} rows of '{name}' but {rows} rows of 'input_ids'",
                    self.path.display(),
                    field.rows()
                )));
            }
        }
        if self.input_mask.width != self.input_ids.width
            || self.segment_ids.width != self.input_ids.width
        {
            return Err(TrainingError::data(format!(
                "shard {} has inconsistent sequence lengths",
                self.path.display()
            )));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.input_ids.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sequence_length(&self) -> usize {
        self.input_ids.width
    }

    pub fn is_packed(&self) -> bool {
        self.packed.is_some()
    }

    /// Masked-LM targets of sample `index`.
    pub fn masked_lm_labels(&self, index: usize) -> Vec<i64> {
        masked_lm_labels(
            self.masked_lm_positions.row(index),
            self.masked_lm_ids.row(index),
            self.sequence_length(),
            self.max_predictions_per_seq,
        )
    }

    /// Next-sentence targets of sample `index`. Packed slots with weight 0
    /// are ignored.
    pub fn next_sentence_labels(&self, index: usize) -> Vec<i64> {
        let labels = self.next_sentence_labels.row(index);
        match &self.packed {
            None => labels.to_vec(),
            Some(packed) => labels
                .iter()
                .zip(packed.next_sentence_weights.row(index))
                .map(|(&label, &weight)| match weight {
                    1 => label,
                    0 => -1,
                    _ => 0,
                })
                .collect(),
        }
    }

    /// Stacks the samples at `indices` into one batch on `device`.
    pub fn batch(&self, indices: &[usize], device: &Device) -> Result<PretrainingBatch> {
        let rows = indices.len();
        let seq = self.sequence_length();
        let gather = |field: &Field| -> Vec<i64> {
            indices
                .iter()
                .flat_map(|&index| field.row(index).iter().copied())
                .collect()
        };
        let to_tensor = |data: Vec<i64>, width: usize| -> Result<Tensor> {
            Tensor::from_vec(data, (rows, width), device).map_err(to_runtime_error)
        };

        let input_ids = to_tensor(gather(&self.input_ids), seq)?;
        let token_type_ids = to_tensor(gather(&self.segment_ids), seq)?;
        let attention_mask = to_tensor(gather(&self.input_mask), seq)?;
        let masked: Vec<i64> = indices
            .iter()
            .flat_map(|&index| self.masked_lm_labels(index))
            .collect();
        let masked_lm_labels = to_tensor(masked, seq)?;

        let nsp: Vec<i64> = indices
            .iter()
            .flat_map(|&index| self.next_sentence_labels(index))
            .collect();

        let (positions, next_sentence_positions, next_sentence_labels) = match &self.packed {
            Some(packed) => {
                let width = packed.next_sentence_positions.width;
                (
                    Some(to_tensor(gather(&packed.positions), seq)?),
                    Some(to_tensor(gather(&packed.next_sentence_positions), width)?),
                    to_tensor(nsp, self.next_sentence_labels.width)?,
                )
            }
            None => {
                let labels = Tensor::from_vec(nsp, rows * self.next_sentence_labels.width, device)
                    .map_err(to_runtime_error)?;
                (None, None, labels)
            }
        };

        Ok(PretrainingBatch {
            inputs: PretrainingInputs {
                input_ids,
                token_type_ids,
                attention_mask,
                positions,
                next_sentence_positions,
            },
            masked_lm_labels,
            next_sentence_labels,
        })
    }
}

/// `-1` everywhere except at the listed positions, which take their token
/// ids. The list ends at its first zero position or after `max_predictions`.
pub fn masked_lm_labels(
    positions: &[i64],
    ids: &[i64],
    sequence_length: usize,
    max_predictions: usize,
) -> Vec<i64> {
    let mut labels = vec![-1i64; sequence_length];
    let limit = positions
        .iter()
        .position(|&p| p == 0)
        .unwrap_or(max_predictions)
        .min(max_predictions)
        .min(positions.len())
        .min(ids.len());
    for (&position, &id) in positions[..limit].iter().zip(&ids[..limit]) {
        if let Ok(position) = usize::try_from(position) {
            if position < sequence_length {
                labels[position] = id;
            }
        }
    }
    labels
}

/// Random-order, drop-last batches over one shard.
#[derive(Debug)]
pub struct ShardBatches {
    dataset: PretrainingDataset,
    order: Vec<usize>,
    micro_batch_size: usize,
    next_batch: usize,
}

impl ShardBatches {
    pub fn new(dataset: PretrainingDataset, micro_batch_size: usize, order_seed: u64) -> Self {
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        let mut rng = StdRng::seed_from_u64(order_seed);
        order.shuffle(&mut rng);
        Self {
            dataset,
            order,
            micro_batch_size: micro_batch_size.max(1),
            next_batch: 0,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.order.len() / self.micro_batch_size
    }

    pub fn position(&self) -> usize {
        self.next_batch
    }

    pub fn seek(&mut self, batch_index: usize) {
        self.next_batch = batch_index.min(self.num_batches());
    }

    pub fn next_batch(&mut self, device: &Device) -> Result<Option<PretrainingBatch>> {
        if self.next_batch >= self.num_batches() {
            return Ok(None);
        }
        let start = self.next_batch * self.micro_batch_size;
        let indices = &self.order[start..start + self.micro_batch_size];
        let batch = self.dataset.batch(indices, device)?;
        self.next_batch += 1;
        Ok(Some(batch))
    }
}

/// Endless stream of micro-batches for one participant. Walks the shard
/// schedule epoch after epoch, loading the next shard in the background.
pub struct DataPipeline {
    input_dir: PathBuf,
    options: DatasetOptions,
    rank: usize,
    world_size: usize,
    device: Device,
    schedule: ShardSchedule,
    shard_index: usize,
    current: ShardBatches,
    prefetcher: ShardPrefetcher,
    pending: Option<PrefetchHandle>,
}

impl DataPipeline {
    /// Starts from the beginning of epoch 0, or from `resume` when given.
    pub fn start(
        input_dir: &Path,
        options: DatasetOptions,
        rank: usize,
        world_size: usize,
        device: Device,
        resume: Option<(ShardSchedule, DataCursor)>,
    ) -> Result<Self> {
        let (schedule, cursor) = match resume {
            Some((schedule, cursor)) => (schedule, cursor),
            None => {
                let schedule =
                    ShardSchedule::discover(input_dir, options.packed, options.seed, 0)?;
                (schedule, DataCursor::default())
            }
        };
        if cursor.shard_index >= schedule.len() {
            return Err(TrainingError::data(format!(
                "shard index {} is outside the {} scheduled files",
                cursor.shard_index,
                schedule.len()
            )));
        }

        let prefetcher = ShardPrefetcher::new()?;
        let seed = order_seed(options.seed, rank, schedule.epoch(), cursor.shard_index);
        let path = schedule.shard_for(cursor.shard_index, rank, world_size);
        let dataset =
            PretrainingDataset::load(path, options.max_predictions_per_seq, options.packed)?;
        let mut current = ShardBatches::new(dataset, options.micro_batch_size, seed);
        current.seek(cursor.batch_index);
        info!(
            epoch = schedule.epoch(),
            shard_index = cursor.shard_index,
            batch_index = cursor.batch_index,
            shard = %path.display(),
            "data pipeline started"
        );

        let mut pipeline = Self {
            input_dir: input_dir.to_path_buf(),
            options,
            rank,
            world_size,
            device,
            schedule,
            shard_index: cursor.shard_index,
            current,
            prefetcher,
            pending: None,
        };
        pipeline.prefetch_next();
        Ok(pipeline)
    }

    pub fn schedule(&self) -> &ShardSchedule {
        &self.schedule
    }

    pub fn epoch(&self) -> usize {
        self.schedule.epoch()
    }

    pub fn cursor(&self) -> DataCursor {
        DataCursor {
            epoch: self.schedule.epoch(),
            shard_index: self.shard_index,
            batch_index: self.current.position(),
        }
    }

    fn prefetch_next(&mut self) {
        let next = self.shard_index + 1;
        self.pending = if next < self.schedule.len() {
            let path = self
                .schedule
                .shard_for(next, self.rank, self.world_size)
                .to_path_buf();
            Some(self.prefetcher.prefetch(
                path,
                self.options.max_predictions_per_seq,
                self.options.packed,
            ))
        } else {
            None
        };
    }

    /// Moves to the next shard, blocking on the prefetched one, or to the
    /// first shard of a freshly shuffled epoch.
    fn advance(&mut self) -> Result<()> {
        let dataset = match self.pending.take() {
            Some(handle) => {
                self.shard_index += 1;
                handle.wait()?
            }
            None => {
                let epoch = self.schedule.epoch() + 1;
                self.schedule = ShardSchedule::discover(
                    &self.input_dir,
                    self.options.packed,
                    self.options.seed,
                    epoch,
                )?;
                self.shard_index = 0;
                info!(epoch, shards = self.schedule.len(), "starting epoch");
                let path = self.schedule.shard_for(0, self.rank, self.world_size);
                PretrainingDataset::load(
                    path,
                    self.options.max_predictions_per_seq,
                    self.options.packed,
                )?
            }
        };
        let seed = order_seed(
            self.options.seed,
            self.rank,
            self.schedule.epoch(),
            self.shard_index,
        );
        self.current = ShardBatches::new(dataset, self.options.micro_batch_size, seed);
        self.prefetch_next();
        Ok(())
    }

    pub fn next_batch(&mut self) -> Result<PretrainingBatch> {
        // Bounded so a schedule whose shards are all smaller than one batch
        // fails instead of spinning.
        let limit = 2 * self.schedule.len() + 2;
        for _ in 0..limit {
            if let Some(batch) = self.current.next_batch(&self.device)? {
                return Ok(batch);
            }
            self.advance()?;
        }
        Err(TrainingError::data(format!(
            "no shard in {} holds a full micro-batch of {}",
            self.input_dir.display(),
            self.options.micro_batch_size
        )))
    }
}
