use std::path::PathBuf;

use futures::{
    executor::{block_on, ThreadPool},
    future::RemoteHandle,
    task::SpawnExt,
};

use super::{PretrainingDataset, Result};
use crate::TrainingError;

/// Loads the next shard on a single background thread.
#[derive(Debug)]
pub struct ShardPrefetcher {
    pool: ThreadPool,
}

/// A shard being loaded. Dropping the handle abandons the load.
#[derive(Debug)]
pub struct PrefetchHandle {
    path: PathBuf,
    inner: Option<RemoteHandle<Result<PretrainingDataset>>>,
}

impl ShardPrefetcher {
    pub fn new() -> Result<Self> {
        let pool = ThreadPool::builder()
            .pool_size(1)
            .name_prefix("shard-prefetch-")
            .create()
            .map_err(|err| {
                TrainingError::initialization(format!("failed to start prefetch thread: {err}"))
            })?;
        Ok(Self { pool })
    }

    pub fn prefetch(
        &self,
        path: PathBuf,
        max_predictions_per_seq: usize,
        packed: bool,
    ) -> PrefetchHandle {
        let target = path.clone();
        let inner = self
            .pool
            .spawn_with_handle(async move {
                PretrainingDataset::load(&target, max_predictions_per_seq, packed)
            })
            .ok();
        PrefetchHandle { path, inner }
    }
}

impl PrefetchHandle {
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Blocks until the shard is loaded.
    pub fn wait(self) -> Result<PretrainingDataset> {
        match self.inner {
            Some(handle) => block_on(handle),
            None => Err(TrainingError::data(format!(
                "prefetch of {} could not be scheduled",
                self.path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::test_support::write_shard;

    #[test]
    fn loads_shard_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x_training.safetensors");
        write_shard(&path, 3, 2, 0);

        let prefetcher = ShardPrefetcher::new().unwrap();
        let handle = prefetcher.prefetch(path.clone(), 2, false);
        assert_eq!(handle.path(), path.as_path());
        let dataset = handle.wait().unwrap();
        assert_eq!(dataset.len(), 3);
    }

    #[test]
    fn missing_shard_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let prefetcher = ShardPrefetcher::new().unwrap();
        let handle = prefetcher.prefetch(dir.path().join("absent"), 2, false);
        assert!(handle.wait().is_err());
    }
}
