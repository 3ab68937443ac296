//! crawltail CLI: tail crawl jobs and scraped pages from a document store.
//!
//! Tailed documents are written to stdout as JSON lines, one event per line.

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
