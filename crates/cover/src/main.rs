//! The `solcov` CLI.

use clap::{Parser, Subcommand};
use eyre::Result;

mod cover;
mod proxy;

#[derive(Parser)]
#[command(name = "solcov", version, about = "Trace-based coverage for Solidity projects")]
struct Solcov {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the test suite behind an intercepting provider and write a
    /// coverage report.
    Cover(cover::CoverArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Solcov::parse().command {
        Command::Cover(args) => args.run().await,
    }
}
