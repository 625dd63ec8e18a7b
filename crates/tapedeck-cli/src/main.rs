//! Tapedeck CLI
//!
//! Command-line interface for the Tapedeck record/replay proxy. `serve` runs
//! a standalone proxy that harnesses drive over its control API; `inspect`
//! summarizes a snapshot file.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tapedeck_core::{ModePolicy, OrderPolicy};
use tracing_subscriber::EnvFilter;

mod inspect;
mod serve;

/// Tapedeck - record once, replay forever
///
/// Sits between an agent CLI and its model API so end-to-end tests run
/// against recorded traffic.
#[derive(Parser, Debug)]
#[command(name = "tapedeck")]
#[command(version, about, long_about = None)]
struct Args {
    /// Output format: text or json
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy until interrupted
    Serve(ServeArgs),
    /// Summarize the exchanges in a snapshot file
    Inspect {
        /// Snapshot file to read
        snapshot: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Port to listen on (0 picks a free one)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Real API base URL
    #[arg(short, long, env = "TAPEDECK_UPSTREAM_URL")]
    upstream: Option<String>,

    /// auto, record or replay
    #[arg(short, long, env = "TAPEDECK_MODE")]
    mode: Option<ModePolicy>,

    /// strict or window:<n>
    #[arg(long, env = "TAPEDECK_ORDER")]
    order: Option<OrderPolicy>,

    /// YAML file with normalization rules
    #[arg(long, env = "TAPEDECK_RULES_FILE")]
    rules: Option<PathBuf>,

    /// Snapshot to configure immediately (absolute path)
    #[arg(long, requires = "work_dir")]
    snapshot: Option<PathBuf>,

    /// Working directory of the process under test
    #[arg(long, requires = "snapshot")]
    work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let json_output = matches!(args.format, OutputFormat::Json);

    let result = match args.command {
        Command::Serve(serve_args) => serve::run(serve_args, json_output).await,
        Command::Inspect { snapshot } => inspect::run(&snapshot, json_output),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
