use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use clmbr_training::{Trainer, TrainingConfig, TrainingError};
use toml::{Table, Value};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Train a CLMBR model", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file (TOML or JSON)"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override a config field, e.g. optimizer.learning_rate=1e-4 or runtime.loss_scale.initial_scale=4"
    )]
    overrides: Vec<OverrideArg>,
}

/// One `--override section.field=value` assignment, parsed as a TOML dotted key.
///
/// Values that are not valid TOML (bare paths, words) are taken as strings.
#[derive(Debug, Clone)]
struct OverrideArg {
    patch: Table,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form section.field=value".to_string())?;
        let (key, value) = (key.trim(), value.trim());
        if !key.contains('.') {
            return Err(format!("override '{key}' must name a config section and field"));
        }
        let patch = format!("{key} = {value}")
            .parse::<Table>()
            .or_else(|_| format!("{key} = {}", Value::String(value.to_string())).parse::<Table>())
            .map_err(|err| format!("invalid override '{s}': {err}"))?;
        Ok(Self { patch })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    config.validate()?;

    let mut trainer = Trainer::new(config)?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let outcome = trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;
    match &outcome.best {
        Some(best) => println!(
            "training {} after {} steps; best step {} with metric {}",
            outcome.reason, outcome.steps, best.step, best.metric
        ),
        None => println!(
            "training {} after {} steps without a best checkpoint",
            outcome.reason, outcome.steps
        ),
    }

    Ok(())
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let Value::Table(mut table) = Value::try_from(config).map_err(|err| {
        TrainingError::ConfigFormat(format!("failed to serialize config for overrides: {err}"))
    })?
    else {
        return Err(TrainingError::ConfigFormat(
            "config did not serialize to a table".into(),
        ));
    };
    for arg in overrides {
        merge_table(&mut table, &arg.patch, "")?;
    }
    Value::Table(table).try_into().map_err(|err| {
        TrainingError::ConfigFormat(format!("config invalid after overrides: {err}"))
    })
}

/// Writes every leaf of `patch` into `target`. A leaf may not replace a table, nor a table a leaf.
fn merge_table(target: &mut Table, patch: &Table, prefix: &str) -> Result<(), TrainingError> {
    for (key, value) in patch {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match (target.get_mut(key), value) {
            (Some(Value::Table(existing)), Value::Table(nested)) => {
                merge_table(existing, nested, &path)?
            }
            (None, Value::Table(nested)) => {
                let mut fresh = Table::new();
                merge_table(&mut fresh, nested, &path)?;
                target.insert(key.clone(), Value::Table(fresh));
            }
            (Some(Value::Table(_)), _) | (Some(_), Value::Table(_)) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "override '{path}' does not match the shape of the config"
                )));
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(())
}
