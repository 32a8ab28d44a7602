//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Chaos Gate - fault injection gated by SLOs
#[derive(Parser, Debug)]
#[command(name = "chaos-gate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CHAOS_GATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "CHAOS_GATE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CHAOS_GATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to run)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a chaos run (default)
    Run(RunArgs),

    /// Load and validate the configuration, then print the catalog
    Validate {
        /// Also print the effective configuration as YAML
        #[arg(long)]
        print_config: bool,
    },
}

/// Overrides for a run
#[derive(clap::Args, Debug, Default)]
pub struct RunArgs {
    /// Directory for the run summary
    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// Run length in minutes
    #[arg(long)]
    pub duration_minutes: Option<u64>,

    /// Do not start a load generator
    #[arg(long)]
    pub no_load_generator: bool,
}
