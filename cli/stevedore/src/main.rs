//! stevedore - build container images without a Dockerfile.
//!
//! Reads a TOML build file and delivers the image to the local daemon, a
//! registry or a tarball.

use anyhow::Result;
use clap::Parser;

mod buildfile;
mod commands;
mod error;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
