//! enrichkit CLI: batch contact enrichment with resumable progress.
//!
//! Imports contact exports into batches, runs lookups over them with a
//! bounded worker pool, and drains discovered profile URLs into follow-up
//! batches.

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
