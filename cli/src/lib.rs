//! The `tusk-drift` command line: configuration loading, trace discovery,
//! run orchestration, and exit-code mapping. The replay engine itself
//! lives in `drift-core`; this crate is its operator-facing shell.

mod cli;
mod discovery;

pub use cli::Cli;
pub use cli::Command;
pub use cli::InspectArgs;
pub use cli::RunArgs;

use std::process::ExitCode;

use anyhow::Context;
use drift_common::elapsed::format_elapsed;
use drift_core::DriftError;
use drift_core::config::RunConfig;
use drift_core::events::LogBus;
use drift_core::events::RunEvent;
use drift_core::executor::Executor;
use drift_protocol::read_spans;
use tracing::debug;
use tracing::error;

/// Exit code for configuration and startup failures, per the contract with
/// CI callers: 0 passed, 1 deviations, 2 crashes, 3 configuration/startup,
/// 4 cancelled.
const EXIT_CONFIGURATION: u8 = 3;
const EXIT_CANCELLED: u8 = 4;

pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = std::env::var("TUSK_DRIFT_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run_main(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Run(args) => match run_replay(args).await {
            Ok(code) => code,
            Err(err) => {
                error!("{err:#}");
                eprintln!("error: {err:#}");
                ExitCode::from(EXIT_CONFIGURATION)
            }
        },
        Command::Inspect(args) => match inspect(&args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("error: {err:#}");
                ExitCode::from(EXIT_CONFIGURATION)
            }
        },
    }
}

async fn run_replay(args: RunArgs) -> anyhow::Result<ExitCode> {
    let config = load_config(&args)?;

    let tests = discovery::load_tests(&args.traces)?;
    println!(
        "discovered {} test{} under {}",
        tests.len(),
        if tests.len() == 1 { "" } else { "s" },
        args.traces.display()
    );

    let bus = LogBus::new();
    let executor = Executor::new(config, bus.clone());

    let cancel = executor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, finishing in-flight tests");
            cancel.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("second interrupt, exiting immediately");
            std::process::exit(i32::from(EXIT_CANCELLED));
        }
    });

    let printer = tokio::spawn(print_events(bus.subscribe(), args.print_events));

    let outcome = match executor.run(tests).await {
        Ok(outcome) => outcome,
        Err(DriftError::Cancelled) => return Ok(ExitCode::from(EXIT_CANCELLED)),
        Err(err) => return Err(err.into()),
    };
    printer.abort();

    let summary = outcome.summary;
    println!(
        "{} total, {} passed, {} failed, {} crashed, {} retried",
        summary.total, summary.passed, summary.failed, summary.crashed, summary.retried
    );
    if outcome.cancelled {
        println!("run cancelled before completion");
    }

    let code = outcome.exit_code();
    debug!(code, "run finished");
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(EXIT_CONFIGURATION)))
}

fn load_config(args: &RunArgs) -> anyhow::Result<RunConfig> {
    let mut config: RunConfig = if args.config.exists() {
        let raw = std::fs::read_to_string(&args.config)
            .with_context(|| format!("failed to read {}", args.config.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", args.config.display()))?
    } else {
        RunConfig::default()
    };

    if let Some(concurrency) = args.concurrency {
        config.run.concurrency = concurrency;
    }
    if let Some(filter) = &args.filter {
        config.run.filter_regex = Some(filter.clone());
    }
    if let Some(results) = &args.results {
        config.run.results_path = Some(results.clone());
    }
    Ok(config)
}

async fn print_events(
    mut events: tokio::sync::broadcast::Receiver<RunEvent>,
    print_service_output: bool,
) {
    while let Ok(event) = events.recv().await {
        match event {
            RunEvent::TestCompleted(result) => {
                let verdict = if result.passed { "PASS" } else { "FAIL" };
                let duration =
                    format_elapsed(std::time::Duration::from_millis(result.duration_ms));
                let mut line = format!("{verdict} {} ({duration})", result.test_id);
                if result.crashed_server {
                    line.push_str(" [crashed]");
                }
                if result.retried_after_crash {
                    line.push_str(" [retried]");
                }
                if let Some(error) = &result.error {
                    line.push_str(&format!(": {error}"));
                } else if !result.deviations.is_empty() {
                    line.push_str(&format!(": {} deviation(s)", result.deviations.len()));
                    for deviation in result.deviations.iter().take(5) {
                        line.push_str(&format!("\n    {}: {}", deviation.field_path, deviation.description));
                    }
                }
                println!("{line}");
            }
            RunEvent::MockNotFound(miss) => {
                println!(
                    "MISS {}: no recorded mock for {} {}",
                    miss.trace_id, miss.package_name, miss.operation
                );
            }
            RunEvent::ServiceStdout(line) if print_service_output => {
                println!("[service] {line}");
            }
            RunEvent::ServiceStderr(line) if print_service_output => {
                eprintln!("[service] {line}");
            }
            _ => {}
        }
    }
}

fn inspect(args: &InspectArgs) -> anyhow::Result<()> {
    let spans = read_spans(&args.file)?;
    println!(
        "{} span{} in {}",
        spans.len(),
        if spans.len() == 1 { "" } else { "s" },
        args.file.display()
    );
    for span in &spans {
        let marker = if span.is_root {
            "root"
        } else if span.is_pre_app_start {
            "pre-app"
        } else {
            "child"
        };
        println!(
            "  {:<12} {:?}  {:<8} {} {}",
            span.span_id, span.kind, marker, span.package_name, span.name
        );
    }
    Ok(())
}
