use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mutation_executor::mutation::{
    AbortReason, AbortToken, AnalysisUnit, Handshake, IndexRange, MemoryWatchdog, MutationBackend,
    MutationWorker, ProcMemoryProbe, RecordWriter, SandboxSpec, SourceTreeBackend, UnitId,
    WatchdogConfig, WorkerError, WorkerExit, WorkerOutcome,
};

/// Mutates one unit over an index range, appending one record per processed index.
#[derive(Debug, Parser)]
#[command(name = "mutation-worker")]
#[command(about = "Process a range of mutants for one target unit")]
struct Args {
    /// First mutation index to process.
    start: usize,
    /// Index one past the last to process.
    end: usize,
    /// Target unit, relative to the project root.
    unit: String,
    /// Handshake input: configuration, sandbox descriptor and test group. `-` reads stdin.
    input: PathBuf,
    /// Record stream; appended to.
    output: PathBuf,
    /// Percentage of the memory limit at which the worker aborts.
    #[arg(long, env = "MUTATION_WORKER_MEMORY_THRESHOLD", default_value_t = 90)]
    memory_threshold: u8,
    /// Memory limit in bytes. Defaults to the cgroup limit, if any.
    #[arg(long, env = "MUTATION_WORKER_MEMORY_LIMIT")]
    memory_limit: Option<u64>,
    /// Memory sampling interval in milliseconds.
    #[arg(long, env = "MUTATION_WORKER_POLL_MS", default_value_t = 250)]
    poll_ms: u64,
}

fn read_handshake(input: &Path) -> Result<Handshake<SandboxSpec>> {
    let handshake = if input.as_os_str() == "-" {
        Handshake::read_from(std::io::stdin().lock())
    } else {
        let file = File::open(input)
            .with_context(|| format!("failed to open handshake {}", input.display()))?;
        Handshake::read_from(BufReader::new(file))
    };
    handshake.context("failed to read handshake")
}

fn run(args: Args) -> Result<WorkerExit> {
    let abort = AbortToken::new();
    let interrupt = abort.clone();
    ctrlc::set_handler(move || interrupt.trip(AbortReason::Interrupted))
        .context("failed to install interrupt handler")?;

    let mut watchdog_config = WatchdogConfig::default()
        .with_threshold_percent(args.memory_threshold)
        .with_poll_interval(Duration::from_millis(args.poll_ms));
    if let Some(limit) = args.memory_limit {
        watchdog_config = watchdog_config.with_limit_bytes(limit);
    }
    let _watchdog = MemoryWatchdog::spawn(
        ProcMemoryProbe::new(watchdog_config.limit_bytes),
        watchdog_config,
        abort.clone(),
        |usage| {
            error!(
                used_bytes = usage.used_bytes,
                limit_bytes = usage.limit_bytes,
                "aborting worker to avoid running out of memory"
            );
            std::process::exit(WorkerExit::OutOfMemory.code());
        },
    )
    .context("failed to start memory watchdog")?;

    let handshake = read_handshake(&args.input)?;
    handshake
        .config
        .validate()
        .context("invalid mutation configuration")?;

    let backend = SourceTreeBackend::new(handshake.context);
    let generator = backend.generator(&handshake.config)?;
    let context = backend
        .create_context()
        .context("failed to create execution context")?;
    let unit = AnalysisUnit::new(
        UnitId::new(args.unit),
        handshake.tests,
        Arc::new(handshake.config),
    )
    .with_range(IndexRange::new(args.start, args.end));
    let mut sink = RecordWriter::append_to(&args.output)
        .with_context(|| format!("failed to open record stream {}", args.output.display()))?;

    let outcome = MutationWorker::new(&generator, context)
        .with_abort_token(abort)
        .process(&unit, &mut sink);
    match outcome {
        Ok(WorkerOutcome::Completed(results)) => {
            info!(
                unit = %unit.target,
                processed = results.records().len(),
                detected = results.detected(),
                "range complete"
            );
            Ok(WorkerExit::Ok)
        }
        Ok(WorkerOutcome::RestartRequired { resume_at, partial }) => {
            info!(
                unit = %unit.target,
                resume_at,
                processed = partial.records().len(),
                "exiting for relaunch"
            );
            Ok(WorkerExit::ForcedRestart)
        }
        Err(WorkerError::Aborted { reason, index }) => {
            info!(unit = %unit.target, index, ?reason, "worker aborted");
            Ok(match reason {
                AbortReason::Interrupted => WorkerExit::Interrupted,
                AbortReason::ResourceExhausted => WorkerExit::OutOfMemory,
            })
        }
        Err(err) => Err(err.into()),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let exit = match run(Args::parse()) {
        Ok(exit) => exit,
        Err(err) => {
            error!(error = %format!("{err:#}"), "worker failed");
            WorkerExit::UnknownError
        }
    };
    std::process::exit(exit.code());
}
