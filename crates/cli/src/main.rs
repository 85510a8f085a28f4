//! visreg CLI - Main Entry Point
//!
//! Runs visual regression suites, captures single pages and manages the
//! stored baselines.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod commands;
mod output;

use commands::{baseline, capture, run};

/// visreg - visual regression testing for web applications
#[derive(Parser, Debug)]
#[command(name = "visreg")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding baselines and run artifacts
    #[arg(long, env = "VISREG_STORE", global = true, default_value_os_t = visreg_common::default_store_path())]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a regression suite
    Run(run::RunArgs),

    /// Capture a single page
    Capture(capture::CaptureArgs),

    /// Manage baselines
    #[command(subcommand)]
    Baseline(baseline::BaselineCommands),

    /// Show version information
    Version,
}

/// Exit status: 0 clean, 1 regressions found, 2 the run itself failed
async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Run(args) => {
            let clean = run::execute(args, cli.store, cli.format).await?;
            return Ok(if clean { ExitCode::SUCCESS } else { ExitCode::from(1) });
        }
        Commands::Capture(args) => capture::execute(args, cli.format).await?,
        Commands::Baseline(cmd) => baseline::execute(cmd, cli.store, cli.format).await?,
        Commands::Version => {
            println!("visreg CLI v{}", visreg_common::VERSION);
            println!("Store: {}", cli.store.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            ExitCode::from(2)
        }
    }
}
