use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;

#[derive(Debug, Parser)]
#[command(name = "tusk-drift", about = "Replay recorded traces against a service and report drift")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Replay traces and compare live responses against the recordings.
    Run(RunArgs),
    /// Print the spans of one trace file.
    Inspect(InspectArgs),
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "tusk-drift.toml")]
    pub config: PathBuf,

    /// Directory scanned (recursively) for trace files.
    #[arg(long, default_value = ".tusk/traces")]
    pub traces: PathBuf,

    /// Only run tests whose name or trace id matches this regex.
    #[arg(long)]
    pub filter: Option<String>,

    /// Number of tests replayed concurrently.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Write one JSON result line per test (plus a summary) to this path.
    #[arg(long)]
    pub results: Option<PathBuf>,

    /// Echo the service's stdout/stderr while the run is going.
    #[arg(long)]
    pub print_events: bool,
}

#[derive(Debug, Parser)]
pub struct InspectArgs {
    /// Trace file to print.
    pub file: PathBuf,
}
