use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use mutation_executor::mutation::{
    AbortReason, AbortToken, AnalysisTask, AnalysisUnit, LoggingListener, MemoryWatchdog,
    MutationAnalysisExecutor, MutationConfig, MutationOperator, MutationResultListener,
    MutationTestUnit, ProcMemoryProbe, SandboxSpec, ScoreListener, SourceTreeBackend, TestGroup,
    UnitId, WatchdogConfig,
};

#[derive(Debug, Parser)]
#[command(name = "cargo-mutate")]
#[command(about = "Mutation analysis over source files of a project")]
struct Cli {
    /// Project directory.
    #[arg(long, default_value = ".")]
    project: PathBuf,
    /// Source file to mutate, relative to the project. Repeatable.
    #[arg(long = "unit", required = true)]
    units: Vec<String>,
    /// Minimum kill rate per unit, in percent.
    #[arg(long, default_value_t = 80)]
    threshold: u32,
    /// Comma-separated operators. Defaults to arithmetic and both conditional families.
    #[arg(long, value_delimiter = ',')]
    operators: Vec<MutationOperator>,
    /// Units analysed at once.
    #[arg(long, default_value_t = 1)]
    concurrency: usize,
    /// Test command, split on whitespace. Test ids are appended.
    #[arg(long, default_value = "cargo test --quiet")]
    test_command: String,
    /// Command that rejects non-viable mutants with a non-zero exit.
    #[arg(long)]
    check_command: Option<String>,
    /// Test id passed to the test command. Repeatable.
    #[arg(long = "test")]
    tests: Vec<String>,
    /// Timeout for each check or test command.
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Directory receiving one record stream per unit.
    #[arg(long)]
    journal_dir: Option<PathBuf>,
    /// Percentage of the memory limit at which analysis stops taking new mutants.
    #[arg(long, env = "CARGO_MUTATE_MEMORY_THRESHOLD", default_value_t = 90)]
    memory_threshold: u8,
    /// Memory limit in bytes, covering test processes. Defaults to the cgroup limit, if any.
    #[arg(long, env = "CARGO_MUTATE_MEMORY_LIMIT")]
    memory_limit: Option<u64>,
}

fn split_command(command: &str) -> Result<Vec<String>> {
    let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    ensure!(!argv.is_empty(), "command must not be empty");
    Ok(argv)
}

fn journal_name(unit: &str) -> String {
    format!("{}.records", unit.replace(['/', '\\'], "_"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = env::args().collect();
    if args.get(1).is_some_and(|arg| arg == "mutate") {
        args.remove(1);
    }
    let cli = Cli::parse_from(args);

    let mut config = MutationConfig::default().with_threshold(cli.threshold);
    if !cli.operators.is_empty() {
        config = config.with_operators(cli.operators.iter().copied());
    }
    config.validate().context("invalid mutation configuration")?;
    let config = Arc::new(config);

    let mut spec = SandboxSpec::new(&cli.project, split_command(&cli.test_command)?);
    spec.check_command = cli
        .check_command
        .as_deref()
        .map(split_command)
        .transpose()?;
    spec.timeout_secs = cli.timeout_secs;
    let backend = Arc::new(SourceTreeBackend::new(spec));

    let tests = cli
        .tests
        .iter()
        .fold(TestGroup::new("tests"), |group, test| group.with_test(test));

    if let Some(dir) = &cli.journal_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create journal dir {}", dir.display()))?;
    }

    let abort = AbortToken::new();
    let interrupt = abort.clone();
    ctrlc::set_handler(move || interrupt.trip(AbortReason::Interrupted))
        .context("failed to install interrupt handler")?;

    let mut watchdog_config =
        WatchdogConfig::default().with_threshold_percent(cli.memory_threshold);
    if let Some(limit) = cli.memory_limit {
        watchdog_config = watchdog_config.with_limit_bytes(limit);
    }
    let watchdog = MemoryWatchdog::spawn(
        ProcMemoryProbe::new(watchdog_config.limit_bytes),
        watchdog_config,
        abort.clone(),
        |usage| {
            warn!(
                used_bytes = usage.used_bytes,
                limit_bytes = usage.limit_bytes,
                "stopping analysis to avoid running out of memory"
            );
        },
    )
    .context("failed to start memory watchdog")?;

    let units: Vec<Box<dyn AnalysisTask>> = cli
        .units
        .iter()
        .map(|unit| {
            let analysis = AnalysisUnit::new(UnitId::new(unit), tests.clone(), Arc::clone(&config));
            let mut task = MutationTestUnit::new(analysis, Arc::clone(&backend))
                .with_abort_token(abort.clone());
            if let Some(dir) = &cli.journal_dir {
                task = task.with_journal(dir.join(journal_name(unit)));
            }
            Box::new(task) as Box<dyn AnalysisTask>
        })
        .collect();

    let listeners: Vec<Box<dyn MutationResultListener>> = vec![
        Box::new(LoggingListener::default()),
        Box::new(ScoreListener::new(config.threshold)),
    ];
    let mut executor = MutationAnalysisExecutor::new(cli.concurrency, listeners);
    let summaries = executor.run(units).await;
    watchdog.stop();
    let summaries = summaries?;

    let mut failed = 0;
    for summary in &summaries {
        println!("{}\t{}", summary.unit, summary.verdict);
        if summary.verdict.is_failure() {
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{failed} of {} unit(s) failed mutation analysis", summaries.len());
    }
    Ok(())
}
