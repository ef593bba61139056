//! Binary entry point for eventdedup.
//!
//! This binary provides the CLI interface for the event deduplication service.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

mod commands;

use clap::{Parser, Subcommand};
use eventdedup::config::AppConfig;
use eventdedup::observability::{self, InitOptions};
use std::path::PathBuf;
use std::process::ExitCode;

/// Eventdedup - duplicate suppression for structured event streams.
#[derive(Parser)]
#[command(name = "eventdedup")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "EVENTDEDUP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP ingestion endpoint.
    Serve {
        /// Listen port (overrides `server.port`).
        #[arg(short, long)]
        port: Option<u16>,

        /// Where accepted events are written (`-` for stdout).
        #[arg(short, long, default_value = "-")]
        output: String,
    },

    /// Consume newline-delimited JSON events, forwarding accepted ones.
    Consume {
        /// Input file (`-` for stdin).
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Output file for accepted events (`-` for stdout).
        #[arg(short, long, default_value = "-")]
        output: String,
    },

    /// Deduplicate a batch and print the report.
    Check {
        /// JSON array, `{"events": [...]}` or JSON lines (`-` for stdin).
        #[arg(default_value = "-")]
        input: String,
    },

    /// Seed the fast tier from the ledger.
    Warm {
        /// How far back to look, in seconds (overrides `dedup.warm_window_secs`).
        #[arg(short, long)]
        window_secs: Option<u64>,
    },

    /// Print the fingerprint of one event.
    Fingerprint {
        /// The event as JSON.
        event: String,
    },
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        },
    };

    let expose_metrics = matches!(cli.command, Commands::Serve { .. });
    let _observability = match observability::init_from_config(
        &config,
        InitOptions {
            verbose: cli.verbose,
            metrics_expose: expose_metrics,
        },
    ) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize observability: {e}");
            return ExitCode::FAILURE;
        },
    };

    match run_command(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

/// Runs the selected command.
fn run_command(command: Commands, config: AppConfig) -> anyhow::Result<()> {
    match command {
        Commands::Serve { port, output } => commands::cmd_serve(config, port, &output),
        Commands::Consume { input, output } => commands::cmd_consume(&config, &input, &output),
        Commands::Check { input } => commands::cmd_check(&config, &input),
        Commands::Warm { window_secs } => commands::cmd_warm(&config, window_secs),
        Commands::Fingerprint { event } => commands::cmd_fingerprint(&config, &event),
    }
}
