use clap::Parser;
use deliver_lib::cli::{run, Cli};
use deliver_lib::logging;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    tracing::debug!(source = %cli.source, "Arguments parsed");
    ExitCode::from(run(cli).await)
}
