//! deployctl - multi-node software provisioning over SSH.
//!
//! Main entry point for the deployctl CLI.

use clap::Parser;
use deployctl::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = cli.execute().await;
    std::process::exit(exit_code);
}
