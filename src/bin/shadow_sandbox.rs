//! shadow-sandbox: inspect and support sandboxed test runs
//!
//! ## Features
//!
//! - **config**: Merge declarative configuration files and print the effective result
//! - **resolve**: Resolve the platform artifact for an SDK level
//! - **runs**: List and summarize run logs written by the JSONL reporter
//!
//! ## Example Usage
//!
//! ```bash
//! # Effective configuration of a package chain (parent first)
//! shadow-sandbox config tests/sandbox.json tests/widget/sandbox.properties
//!
//! # Resolve the SDK 30 platform artifact from a local repository
//! shadow-sandbox resolve --sdk 30 --repository ~/.m2/repository
//!
//! # Summarize the most recent run
//! shadow-sandbox runs show --latest
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod sandbox_cli;

use sandbox_cli::{config::ConfigCmd, resolve::ResolveCmd, runs::RunsCmd};

#[derive(Parser)]
#[command(
    name = "shadow-sandbox",
    author,
    version,
    about = "Sandboxed platform test tooling",
    long_about = "Tools around the shadow sandbox test runner.\n\n\
                  Inspects declarative configuration, resolves platform artifacts and \
                  summarizes run logs."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON instead of human-readable format
    #[arg(long, global = true)]
    json: bool,

    /// Show debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge declarative configuration files and print the effective configuration
    Config(ConfigCmd),

    /// Resolve the platform artifact for an SDK level
    Resolve(ResolveCmd),

    /// List and summarize run logs
    Runs(RunsCmd),
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    let Cli {
        command,
        json,
        verbose,
    } = Cli::parse();
    init_tracing(verbose);

    match command {
        Commands::Config(cmd) => cmd.execute(json),
        Commands::Resolve(cmd) => cmd.execute(json),
        Commands::Runs(cmd) => cmd.execute(json),
    }
}
