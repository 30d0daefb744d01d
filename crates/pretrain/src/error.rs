use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    #[error("training failed: {0}")]
    Runtime(String),
    #[error("collective operation failed: {0}")]
    Collective(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("data error: {0}")]
    Data(String),
    #[error("dataset metadata error: {0}")]
    Metadata(String),
    #[error(transparent)]
    Model(#[from] bert::ModelError),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn collective(message: impl Into<String>) -> Self {
        Self::Collective(message.into())
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }

    pub fn metadata(message: impl Into<String>) -> Self {
        Self::Metadata(message.into())
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
