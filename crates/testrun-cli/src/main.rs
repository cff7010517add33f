//! testrun CLI - runs test files in parallel worker processes.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use testrun_core::{RunEvent, RunEventKind, Shard, StateChange, TestFile};
use testrun_ipc::ProcessTransport;
use testrun_runner::{Coordinator, RunConfig, RunStatus};

/// testrun - run test files in parallel workers
#[derive(Parser)]
#[command(name = "testrun")]
#[command(about = "Run test files in parallel worker processes", long_about = None)]
struct Cli {
    /// Program that runs one test file. The file path is passed as its last argument.
    #[arg(short, long)]
    runtime: PathBuf,

    /// Argument passed to the runtime before the file path (repeatable)
    #[arg(long = "runtime-arg", allow_hyphen_values = true)]
    runtime_args: Vec<String>,

    /// Test files to run
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Maximum number of files running at once (0 picks a default)
    #[arg(short, long, default_value_t = 0)]
    concurrency: usize,

    /// Run one file at a time
    #[arg(short, long)]
    serial: bool,

    /// Stop starting files after the first failure
    #[arg(long)]
    fail_fast: bool,

    /// Inactivity timeout such as 10s, 500ms or 2m (0 disables it)
    #[arg(short, long, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Run only one shard of the files, as INDEX/TOTAL (1-based)
    #[arg(long, value_parser = parse_shard)]
    shard: Option<Shard>,

    /// Directory for the failing-tests cache
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Don't read or write the failing-tests cache
    #[arg(long)]
    no_cache: bool,

    /// Debug mode: disables the inactivity timeout
    #[arg(long)]
    debug: bool,

    /// JSON passed to every worker in its options
    #[arg(long, value_parser = parse_json)]
    worker_options: Option<Value>,

    /// Print run events as JSON lines instead of text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so worker output keeps stdout.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cwd = std::env::current_dir()?;
    let config = run_config(&cli, &cwd)?;
    let files = test_files(&cli.files, &cwd)?;

    let transport = ProcessTransport::new(&cli.runtime)
        .with_args(cli.runtime_args.iter().cloned())
        .with_current_dir(&cwd);
    let coordinator = Coordinator::new(config, Arc::new(transport));

    let reporter = tokio::spawn(report(coordinator.subscribe(), cwd, cli.json));

    let interrupt = CancellationToken::new();
    {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, stopping workers");
                interrupt.cancel();
            }
        });
    }

    let status = coordinator.run(files, interrupt).await?;

    // Dropping the coordinator closes the event channel and ends the reporter.
    drop(coordinator);
    if let Err(e) = reporter.await {
        warn!(error = %e, "Reporter task failed");
    }

    if !cli.json {
        print_summary(&status);
    }
    std::process::exit(status.exit_code());
}

fn run_config(cli: &Cli, cwd: &Path) -> Result<RunConfig, Box<dyn std::error::Error>> {
    let mut config = RunConfig::from_env()?
        .with_concurrency(cli.concurrency)
        .with_serial(cli.serial)
        .with_fail_fast(cli.fail_fast)
        .with_debug(cli.debug)
        .with_cache_enabled(!cli.no_cache)
        .with_cache_dir(
            cli.cache_dir
                .clone()
                .unwrap_or_else(|| cwd.join(".cache").join("testrun")),
        );

    if let Some(timeout) = cli.timeout {
        config = config.with_timeout(Some(timeout));
    }
    if let Some(shard) = cli.shard {
        config = config.with_shard(shard);
    }
    if let Some(options) = &cli.worker_options {
        config = config.with_worker_options(options.clone());
    }
    Ok(config)
}

fn test_files(paths: &[PathBuf], cwd: &Path) -> Result<Vec<TestFile>, Box<dyn std::error::Error>> {
    let files = paths
        .iter()
        .map(|path| TestFile::new(cwd.join(path)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(files)
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{value}'"))?;

    match unit {
        "ms" => Ok(Duration::from_millis(number)),
        "" | "s" => Ok(Duration::from_secs(number)),
        "m" => number
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{value}' is too large")),
        _ => Err(format!("unknown duration unit '{unit}' (use ms, s or m)")),
    }
}

fn parse_shard(value: &str) -> Result<Shard, String> {
    let (index, total) = value
        .split_once('/')
        .ok_or_else(|| format!("expected INDEX/TOTAL, got '{value}'"))?;
    let index: usize = index
        .trim()
        .parse()
        .map_err(|_| format!("invalid shard index '{index}'"))?;
    let total: usize = total
        .trim()
        .parse()
        .map_err(|_| format!("invalid shard total '{total}'"))?;
    if index == 0 {
        return Err("shard index is 1-based".to_string());
    }
    Shard::new(index - 1, total).map_err(|e| e.to_string())
}

fn parse_json(value: &str) -> Result<Value, String> {
    serde_json::from_str(value).map_err(|e| e.to_string())
}

async fn report(mut events: broadcast::Receiver<RunEvent>, cwd: PathBuf, json: bool) {
    loop {
        match events.recv().await {
            Ok(event) if json => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            },
            Ok(event) => print_event(&event, &cwd),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Reporter fell behind, events dropped"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_event(event: &RunEvent, cwd: &Path) {
    match &event.kind {
        RunEventKind::Starting {
            selected_files,
            total_files,
            shard,
            ..
        } => match shard {
            Some(shard) => println!(
                "Running {selected_files} of {total_files} test files (shard {shard})"
            ),
            None => println!("Running {selected_files} test files"),
        },
        RunEventKind::StateChange { file, change, .. } => print_change(&display(file, cwd), change),
        RunEventKind::Timeout {
            period_ms,
            pending_files,
        } => {
            println!("Timed out after {period_ms}ms without activity while running:");
            for file in pending_files {
                println!("  - {}", display(file, cwd));
            }
        }
        RunEventKind::Interrupt => println!("Interrupted"),
        RunEventKind::InternalError { message } => println!("Internal error: {message}"),
        RunEventKind::SharedWorkerError { file, channel_id } => println!(
            "Shared worker channel {channel_id} errored in {}",
            display(file, cwd)
        ),
    }
}

fn print_change(file: &str, change: &StateChange) {
    match change {
        StateChange::TestPassed { title, duration_ms } => match duration_ms {
            Some(ms) => println!("  ok    {file} > {title} ({ms}ms)"),
            None => println!("  ok    {file} > {title}"),
        },
        StateChange::TestFailed { title, error, .. } => {
            println!("  FAIL  {file} > {title}");
            println!("        {error}");
        }
        StateChange::TestSkipped { title } => println!("  skip  {file} > {title}"),
        StateChange::TestTodo { title } => println!("  todo  {file} > {title}"),
        StateChange::HookFailed { title, error } => {
            println!("  HOOK  {file} > {title}");
            println!("        {error}");
        }
        StateChange::UncaughtException { error } => println!("  Uncaught exception in {file}: {error}"),
        StateChange::UnhandledRejection { error } => {
            println!("  Unhandled rejection in {file}: {error}")
        }
        StateChange::WorkerStdout { chunk } => {
            let _ = io::stdout().lock().write_all(chunk);
        }
        StateChange::WorkerStderr { chunk } => {
            let _ = io::stderr().lock().write_all(chunk);
        }
        StateChange::WorkerFailed { failure } => println!("  {file} {failure}"),
        StateChange::WorkerFinished { forced_exit: true } => println!("  {file} was stopped"),
        StateChange::DeclaredTest { .. }
        | StateChange::TestTimeoutConfigured { .. }
        | StateChange::WorkerFinished { forced_exit: false } => {}
    }
}

fn print_summary(status: &RunStatus) {
    let stats = status.stats();
    println!("{}", "-".repeat(60));
    println!(
        "  {} passed, {} failed, {} skipped, {} todo",
        stats.passed_tests, stats.failed_tests, stats.skipped_tests, stats.todo_tests
    );
    if stats.failed_hooks > 0 {
        println!("  {} hooks failed", stats.failed_hooks);
    }
    if stats.uncaught_exceptions + stats.unhandled_rejections > 0 {
        println!(
            "  {} uncaught exceptions, {} unhandled rejections",
            stats.uncaught_exceptions, stats.unhandled_rejections
        );
    }
    if stats.worker_failures > 0 {
        println!("  {} test files exited with an error", stats.worker_failures);
    }

    let skipped = status.skipped_files();
    if !skipped.is_empty() && !status.is_no_op() {
        println!("  {} test files were not run", skipped.len());
    }
}

fn display(file: &TestFile, cwd: &Path) -> String {
    file.path()
        .strip_prefix(cwd)
        .map(|relative| relative.display().to_string())
        .unwrap_or_else(|_| file.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("7"), Ok(Duration::from_secs(7)));
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
        assert!(parse_duration("1h").is_err());
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_overflowing_minutes() {
        let max = u64::MAX / 60;
        assert_eq!(parse_duration(&format!("{max}m")), Ok(Duration::from_secs(max * 60)));
        assert!(parse_duration(&format!("{}m", max + 1)).is_err());
    }

    #[test]
    fn test_parse_shard_is_one_based() {
        assert_eq!(parse_shard("1/3"), Ok(Shard::new(0, 3).unwrap()));
        assert_eq!(parse_shard("3/3"), Ok(Shard::new(2, 3).unwrap()));
        assert!(parse_shard("0/3").is_err());
        assert!(parse_shard("4/3").is_err());
        assert!(parse_shard("3").is_err());
    }

    #[test]
    fn test_relative_files_resolved_against_cwd() {
        let files = test_files(&[PathBuf::from("test/a.js")], Path::new("/repo")).unwrap();
        assert_eq!(files[0].path(), Path::new("/repo/test/a.js"));
        assert_eq!(display(&files[0], Path::new("/repo")), "test/a.js");
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "testrun",
            "--runtime",
            "node",
            "--runtime-arg",
            "--no-warnings",
            "--shard",
            "2/4",
            "--timeout",
            "0",
            "a.js",
            "b.js",
        ])
        .unwrap();
        assert_eq!(cli.runtime_args, vec!["--no-warnings".to_string()]);
        assert_eq!(cli.files.len(), 2);

        let config = run_config(&cli, Path::new("/repo")).unwrap();
        assert_eq!(config.shard, Some(Shard::new(1, 4).unwrap()));
        assert!(config.effective_timeout().is_none());
        assert_eq!(config.cache_dir, Some(PathBuf::from("/repo/.cache/testrun")));
    }
}
