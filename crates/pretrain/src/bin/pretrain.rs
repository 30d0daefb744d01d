use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::{bail, Context, Result};
use bert::{BertForPreTraining, BertPretrainingCriterion, HookFilter, PretrainingModel};
use candle_core::Device;
use clap::Parser;
use pretrain::{
    init_tracing, CandleStream, Communicator, DistributedIdentity, SingleProcess, ThreadGroup,
    Trainer, TrainingConfig, TrainingError, TrainingSummary,
};
use serde_json::{Number, Value};
use tracing::{error, info};

fn main() {
    if let Err(err) = run() {
        eprintln!("pretraining failed: {err:#}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "BERT pretraining with per-step compute deadlines", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to training config file")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Resume from a checkpoint in the output directory")]
    resume: bool,

    #[arg(long, value_name = "STEP", help = "Checkpoint step to resume from (default: latest)")]
    resume_step: Option<usize>,

    #[arg(long, value_name = "PATH", help = "Initialize weights from this checkpoint")]
    init_checkpoint: Option<PathBuf>,

    #[arg(
        long,
        value_name = "N",
        help = "Run N participants as threads of this process"
    )]
    world_size: Option<usize>,

    #[arg(long, default_value = "info", help = "Default log filter when RUST_LOG is unset")]
    log_level: String,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let mut config = TrainingConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    if args.resume || args.resume_step.is_some() || args.init_checkpoint.is_some() {
        config.runtime.resume_from_checkpoint = true;
    }
    if args.resume_step.is_some() {
        config.runtime.resume_step = args.resume_step;
    }
    if args.init_checkpoint.is_some() {
        config.runtime.init_checkpoint = args.init_checkpoint.clone();
    }
    config.validate()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install signal handler")?;

    let identity = DistributedIdentity::from_env()?;
    let summary = match args.world_size {
        Some(world) if world > 1 => run_thread_group(&config, world, &shutdown)?,
        _ => {
            if identity.world_size > 1 {
                bail!(
                    "launcher reports world size {} but only in-process participants are \
                     available; pass --world-size instead",
                    identity.world_size
                );
            }
            run_participant(config, Box::new(SingleProcess), 0, &shutdown)?
        }
    };

    info!(
        final_loss = summary.final_loss,
        global_step = summary.global_step,
        skipped_steps = summary.skipped_steps,
        sequences_per_second = summary.training_sequences_per_second,
        "training complete"
    );
    Ok(())
}

fn run_thread_group(
    config: &TrainingConfig,
    world: usize,
    shutdown: &Arc<AtomicBool>,
) -> Result<TrainingSummary> {
    let groups = ThreadGroup::new(world);
    let results: Vec<Result<TrainingSummary>> = thread::scope(|scope| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                let config = config.clone();
                scope.spawn(move || {
                    let rank = group.rank();
                    run_participant(config, Box::new(group), rank, shutdown)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("participant thread panicked")),
            })
            .collect()
    });

    let mut summary = None;
    let mut failures = Vec::new();
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(value) if rank == 0 => summary = Some(value),
            Ok(_) => {}
            Err(err) => {
                error!(rank, error = %format!("{err:#}"), "participant failed");
                failures.push(err);
            }
        }
    }
    if let Some(err) = first_root_cause(failures) {
        return Err(err);
    }
    summary.context("no participant produced a summary")
}

/// Peers of a failed participant only report that it left the group, so
/// prefer any error that is not a collective failure.
fn first_root_cause(failures: Vec<anyhow::Error>) -> Option<anyhow::Error> {
    let is_collective = |err: &anyhow::Error| {
        matches!(
            err.downcast_ref::<TrainingError>(),
            Some(TrainingError::Collective(_))
        )
    };
    let position = failures
        .iter()
        .position(|err| !is_collective(err))
        .unwrap_or(0);
    failures.into_iter().nth(position)
}

fn run_participant(
    config: TrainingConfig,
    comm: Box<dyn Communicator>,
    local_rank: usize,
    shutdown: &Arc<AtomicBool>,
) -> Result<TrainingSummary> {
    let device = Device::cuda_if_available(local_rank)?;
    let hooks = HookFilter::new(&config.compute_drop.hooked_modules)
        .map_err(|err| TrainingError::initialization(format!("invalid hooked module: {err}")))?;

    let bert_config = config.bert_config()?;
    let criterion = BertPretrainingCriterion::new(bert_config.vocab_size).with_hooks(hooks.clone());
    let model = BertForPreTraining::new(bert_config, &device)?.with_hooks(hooks.clone());
    if comm.is_main_process() {
        let mut points = model.hook_points();
        points.push(criterion.hook_point().to_string());
        hooks.announce(&points);
    }

    let stream = CandleStream::new(device.clone());
    let mut trainer = Trainer::new(config, comm, model, criterion, stream, device)?;
    let summary = trainer.train_with_shutdown(|| shutdown.load(Ordering::Relaxed))?;
    Ok(summary)
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

/// Sets `path` (dot-separated object keys) inside `value`, creating
/// intermediate objects as needed.
fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::runtime(format!(
            "invalid override path '{path}'"
        )));
    }

    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return Err(TrainingError::runtime("override path must not be empty")),
    };
    let mut current = value;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return Err(TrainingError::runtime(format!(
                "override path segment '{segment}' points to non-object value"
            )));
        };
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    if current.is_null() {
        *current = Value::Object(serde_json::Map::new());
    }
    let Some(map) = current.as_object_mut() else {
        return Err(TrainingError::runtime(format!(
            "override path '{path}' does not end in an object field"
        )));
    };
    map.insert(last.to_string(), new_value);
    Ok(())
}
