use clap::Parser;
use std::process::ExitCode;
use tether::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize logging
    cli.init_logging()?;

    // Execute command
    cli.execute().await
}
