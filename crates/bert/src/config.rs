use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::errors::ModelError;

/// Hyperparameters of the pretraining network, read from the usual BERT
/// `config.json` layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BertConfig {
    pub vocab_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl BertConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config: BertConfig = serde_json::from_str(&contents)
            .map_err(|err| ModelError::Config(err.to_string()))?;
        let config = config.padded_vocab();
        config.validate()?;
        Ok(config)
    }

    /// Rounds the vocabulary up to a multiple of 8.
    pub fn padded_vocab(mut self) -> Self {
        let rem = self.vocab_size % 8;
        if rem != 0 {
            self.vocab_size += 8 - rem;
        }
        self
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads.max(1)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.vocab_size == 0 {
            return Err(ModelError::Config("vocab_size must be greater than zero".into()));
        }
        if self.hidden_size == 0 || self.num_attention_heads == 0 {
            return Err(ModelError::Config(
                "hidden_size and num_attention_heads must be greater than zero".into(),
            ));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(ModelError::Config(format!(
                "hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_hidden_layers == 0 {
            return Err(ModelError::Config(
                "num_hidden_layers must be greater than zero".into(),
            ));
        }
        if self.type_vocab_size == 0 || self.max_position_embeddings == 0 {
            return Err(ModelError::Config(
                "type_vocab_size and max_position_embeddings must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for BertConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30_528,
            hidden_size: default_hidden_size(),
            num_hidden_layers: default_num_hidden_layers(),
            num_attention_heads: default_num_attention_heads(),
            intermediate_size: default_intermediate_size(),
            max_position_embeddings: default_max_position_embeddings(),
            type_vocab_size: default_type_vocab_size(),
            initializer_range: default_initializer_range(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

fn default_hidden_size() -> usize {
    768
}

fn default_num_hidden_layers() -> usize {
    12
}

fn default_num_attention_heads() -> usize {
    12
}

fn default_intermediate_size() -> usize {
    3072
}

fn default_max_position_embeddings() -> usize {
    512
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_initializer_range() -> f64 {
    0.02
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_vocab_to_multiple_of_eight() {
        let config = BertConfig {
            vocab_size: 30_522,
            ..BertConfig::default()
        }
        .padded_vocab();
        assert_eq!(config.vocab_size, 30_528);

        let aligned = BertConfig {
            vocab_size: 64,
            ..BertConfig::default()
        }
        .padded_vocab();
        assert_eq!(aligned.vocab_size, 64);
    }

    #[test]
    fn reads_json_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"vocab_size": 100, "hidden_size": 32, "num_attention_heads": 4, "num_hidden_layers": 2, "intermediate_size": 64}"#,
        )
        .unwrap();

        let config = BertConfig::from_json_file(&path).unwrap();
        assert_eq!(config.vocab_size, 104);
        assert_eq!(config.head_dim(), 8);
        assert_eq!(config.type_vocab_size, 2);
    }

    #[test]
    fn rejects_indivisible_heads() {
        let config = BertConfig {
            vocab_size: 64,
            hidden_size: 30,
            num_attention_heads: 4,
            ..BertConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
