use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde_json::{json, Map, Value};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::TrainingError;

pub const STEP_LOG_FILENAME: &str = "pretrain_log.json";

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides `level`.
pub fn init_tracing(level: &str) -> Result<(), TrainingError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .map_err(|err| TrainingError::initialization(format!("failed to initialize logging: {err}")))
}

/// What a structured log entry is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKey {
    Parameter,
    Training { epoch: usize, global_step: usize },
    Final,
}

impl StepKey {
    fn to_json(self) -> Value {
        match self {
            StepKey::Parameter => Value::from("PARAMETER"),
            StepKey::Training { epoch, global_step } => json!([epoch, global_step]),
            StepKey::Final => json!([]),
        }
    }

    fn label(self) -> String {
        match self {
            StepKey::Parameter => "PARAMETER".to_string(),
            StepKey::Training { epoch, global_step } => {
                format!("Training Epoch: {epoch} Training Iteration: {global_step}")
            }
            StepKey::Final => String::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    /// Directory for the JSON-lines file; `None` disables it.
    pub json_dir: Option<PathBuf>,
}

impl LoggingSettings {
    /// Active backends on the main process, none elsewhere.
    pub fn for_rank(is_main_process: bool, log_dir: &Path) -> Self {
        if is_main_process {
            Self {
                enable_stdout: true,
                json_dir: Some(log_dir.to_path_buf()),
            }
        } else {
            Self::disabled()
        }
    }

    pub fn disabled() -> Self {
        Self {
            enable_stdout: false,
            json_dir: None,
        }
    }
}

/// Step-tagged metric log written as JSON lines and echoed to stdout.
pub struct StepLogger {
    settings: LoggingSettings,
    json: Option<BufWriter<File>>,
}

impl StepLogger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let json = match settings.json_dir.as_ref() {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let path = dir.join(STEP_LOG_FILENAME);
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|err| {
                        TrainingError::initialization(format!(
                            "failed to open step log {}: {err}",
                            path.display()
                        ))
                    })?;
                Some(BufWriter::new(file))
            }
            None => None,
        };
        Ok(Self { settings, json })
    }

    pub fn disabled() -> Self {
        Self {
            settings: LoggingSettings::disabled(),
            json: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.settings.enable_stdout || self.json.is_some()
    }

    pub fn log(&mut self, step: StepKey, data: Map<String, Value>) {
        if !self.is_active() {
            return;
        }

        if self.settings.enable_stdout {
            let fields = data
                .iter()
                .map(|(key, value)| match value {
                    Value::String(text) => format!("{key} : {text}"),
                    other => format!("{key} : {other}"),
                })
                .collect::<Vec<_>>()
                .join(" ");
            let label = step.label();
            if label.is_empty() {
                println!("{fields}");
            } else {
                println!("{label} {fields}");
            }
        }

        if let Some(writer) = self.json.as_mut() {
            let entry = json!({
                "timestamp": wall_time(),
                "step": step.to_json(),
                "data": Value::Object(data),
            });
            // A failed metrics write never stops training.
            let _ = serde_json::to_writer(&mut *writer, &entry);
            let _ = writer.write_all(b"\n");
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.json.as_mut() {
            let _ = writer.flush();
        }
    }
}

impl Drop for StepLogger {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Formats a metric the way the step log prints floats.
pub fn metric(value: f64) -> Value {
    Value::from(format!("{value:.4}"))
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}
