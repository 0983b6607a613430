use std::process::ExitCode;

use clap::Parser;
use drift_cli::Cli;

fn main() -> ExitCode {
    drift_cli::init_logging();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start async runtime: {err}");
            return ExitCode::from(3);
        }
    };
    runtime.block_on(drift_cli::run_main(cli))
}
