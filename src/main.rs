use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use vlm_inspector::config::Config;
use vlm_inspector::driver::{BatchDriver, BatchSummary, ExitPolicy};
use vlm_inspector::error::InspectError;
use vlm_inspector::metrics;

const EXIT_OK: u8 = 0;
const EXIT_THRESHOLD: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

/// Batch visual inspection against an OpenAI-compatible vision endpoint.
#[derive(Debug, Parser)]
#[command(name = "vlm-inspector", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override paths.input_dir
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Append one JSON line per image to this file
    #[arg(long)]
    jsonl: Option<PathBuf>,

    /// Exit non-zero when more than this many images fail
    #[arg(long)]
    max_errors: Option<usize>,

    /// Exit non-zero if any image fails
    #[arg(long)]
    strict: bool,

    /// Write Prometheus text metrics here when the batch ends
    #[arg(long)]
    metrics_file: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `vlm_inspector=trace` (RUST_LOG wins)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = cli.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_filter))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!("{:#}", err);
            ExitCode::from(failure_code(&err))
        }
    }
}

/// Exit status for a batch that ran to the end or was interrupted.
fn exit_code(summary: &BatchSummary, policy: &ExitPolicy) -> u8 {
    if summary.cancelled {
        EXIT_INTERRUPTED
    } else if policy.tripped(summary) {
        EXIT_THRESHOLD
    } else {
        EXIT_OK
    }
}

/// Exit status for an error that stopped the run before a summary existed.
fn failure_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<InspectError>() {
        Some(InspectError::Configuration(_)) => EXIT_CONFIG,
        _ => EXIT_THRESHOLD,
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = load_config(&cli)?;
    tracing::info!("Loaded configuration from {}", cli.config.display());

    metrics::init_metrics();

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; finishing the current image (press again to abort)");
            flag.store(true, Ordering::SeqCst);
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(EXIT_INTERRUPTED as i32);
            }
        }
    });

    let mut driver = BatchDriver::new(&config)?;
    let summary = driver.run(&cancel).await?;

    if let Some(path) = &cli.metrics_file {
        std::fs::write(path, metrics::export_metrics())
            .with_context(|| format!("writing metrics to {}", path.display()))?;
        tracing::info!("Metrics written to {}", path.display());
    }

    let policy = ExitPolicy::from_config(&config);
    let code = exit_code(&summary, &policy);
    if code == EXIT_THRESHOLD {
        tracing::error!(
            "{} image(s) failed (max_errors={:?}, strict={})",
            summary.errored,
            policy.max_errors,
            policy.strict
        );
    }
    Ok(code)
}

/// File, then command-line overrides, then environment, then validation.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::read(&cli.config)?;
    if let Some(dir) = &cli.input_dir {
        config.paths.input_dir = dir.clone();
    }
    if let Some(jsonl) = &cli.jsonl {
        config.paths.jsonl = Some(jsonl.clone());
    }
    if cli.max_errors.is_some() {
        config.max_errors = cli.max_errors;
    }
    if cli.strict {
        config.strict = true;
    }
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}
