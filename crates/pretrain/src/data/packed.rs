use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{info, warn};

use super::Result;
use crate::TrainingError;

pub const AVG_SEQ_PER_SAMPLE_KEY: &str = "avg_seq_per_sample";

/// `<parent>/<dir_name>_metadata.json` next to the shard directory.
pub fn metadata_path(input_dir: &Path) -> PathBuf {
    let trimmed: PathBuf = input_dir.components().collect();
    let name = trimmed
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = trimmed.parent().unwrap_or_else(|| Path::new(""));
    parent.join(format!("{name}_metadata.json"))
}

/// Average number of sequences per packed sample. Falls back to fixed values
/// for the two standard sequence lengths when no metadata file exists.
pub fn read_avg_seq_per_sample(input_dir: &Path, max_seq_length: usize) -> Result<f64> {
    let path = metadata_path(input_dir);
    info!(path = %path.display(), "reading dataset metadata");

    if !path.exists() {
        warn!("packed dataset metadata not found, using default avg_seq_per_sample");
        return match max_seq_length {
            128 => Ok(1.2),
            512 => Ok(2.0),
            other => Err(TrainingError::metadata(format!(
                "no metadata at {} and no default for max_seq_length {other}",
                path.display()
            ))),
        };
    }

    let contents = fs::read_to_string(&path)?;
    let metadata: serde_json::Value = serde_json::from_str(&contents).map_err(|err| {
        TrainingError::metadata(format!("invalid metadata in {}: {err}", path.display()))
    })?;
    let value = metadata
        .get(AVG_SEQ_PER_SAMPLE_KEY)
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| {
            TrainingError::metadata(format!(
                "key {AVG_SEQ_PER_SAMPLE_KEY} not present in {}",
                path.display()
            ))
        })?;
    if value <= 0.0 {
        return Err(TrainingError::metadata(format!(
            "{AVG_SEQ_PER_SAMPLE_KEY} must be positive, found {value}"
        )));
    }
    info!(avg_seq_per_sample = value, "dataset metadata loaded");
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_sits_next_to_input_dir() {
        let path = metadata_path(Path::new("/data/packed_512/"));
        assert_eq!(path, PathBuf::from("/data/packed_512_metadata.json"));
    }

    #[test]
    fn falls_back_to_defaults() {
        let root = tempfile::tempdir().unwrap();
        let input = root.path().join("shards");
        fs::create_dir(&input).unwrap();
        assert_eq!(read_avg_seq_per_sample(&input, 128).unwrap(), 1.2);
        assert_eq!(read_avg_seq_per_sample(&input, 512).unwrap(), 2.0);
        assert!(matches!(
            read_avg_seq_per_sample(&input, 256),
            Err(TrainingError::Metadata(_))
        ));
    }

    #[test]
    fn reads_value_or_rejects_missing_key() {
        let root = tempfile::tempdir().unwrap();
        let input = root.path().join("shards");
        fs::create_dir(&input).unwrap();
        let meta = root.path().join("shards_metadata.json");

        fs::write(&meta, r#"{"avg_seq_per_sample": 1.75}"#).unwrap();
        assert_eq!(read_avg_seq_per_sample(&input, 256).unwrap(), 1.75);

        fs::write(&meta, r#"{"other": 3}"#).unwrap();
        assert!(matches!(
            read_avg_seq_per_sample(&input, 512),
            Err(TrainingError::Metadata(_))
        ));
    }
}
