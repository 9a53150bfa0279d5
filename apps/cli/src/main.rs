//! reportflow CLI: report pipeline runs, workers, and corpus search.
//!
//! Creates runs, drives the staged job pipeline with one or more workers,
//! and ranks the local document corpus.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
