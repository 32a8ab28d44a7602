//! Chaos Gate - fault injection gated by SLOs
//!
//! Injects faults into a running system, watches SLO gates, backs off when
//! they trip and always cleans up after itself.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use chaos_gate::{
    cli::{Cli, Command, RunArgs},
    config::Config,
    orchestrator::{Orchestrator, RunDeps},
    setup_tracing, telemetry,
};

/// Exit code when the cleanup sweep left a fault in place
const EXIT_CLEANUP_FAILED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Validate { print_config }) => {
            run_validate(cli.config.as_deref(), print_config)
        }
        Some(Command::Run(args)) => run_chaos(cli.config.as_deref(), args).await,
        None => run_chaos(cli.config.as_deref(), RunArgs::default()).await,
    }
}

/// Validate configuration and print what a run would do
fn run_validate(path: Option<&Path>, print_config: bool) -> ExitCode {
    let config = match Config::load(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let catalog = match config.validate() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ Validation failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("✅ {} - valid ({} minutes)", config.name, config.duration_minutes);
    if !config.description.is_empty() {
        println!("   {}", config.description);
    }

    println!("\nFaults ({}):", catalog.len());
    for fault in catalog.iter() {
        println!(
            "  {:<20} {:<13} {:<8} {:>4}s  p={:.2}",
            fault.name,
            fault.fault_type.as_str(),
            fault.severity.as_str(),
            fault.duration_seconds,
            fault.probability
        );
    }

    println!("\nSLO gates ({}):", config.slo_gates.len());
    for gate in &config.slo_gates {
        let trigger = if gate.backpressure_trigger {
            " [backpressure]"
        } else {
            ""
        };
        println!(
            "  {:<20} {} {} {} over {}s ({}){trigger}",
            gate.name, gate.metric, gate.operator, gate.threshold, gate.window_seconds, gate.severity
        );
    }

    if print_config {
        match serde_yaml::to_string(&config) {
            Ok(yaml) => println!("\nEffective configuration:\n{yaml}"),
            Err(e) => {
                eprintln!("❌ Failed to render configuration: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

/// Execute a chaos run
async fn run_chaos(path: Option<&Path>, args: RunArgs) -> ExitCode {
    // Load configuration
    let config = match Config::load(path) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(minutes) = args.duration_minutes {
                config.duration_minutes = minutes;
            }
            if let Some(ref dir) = args.results_dir {
                config.output.results_dir = dir.to_string_lossy().into_owned();
            }
            if args.no_load_generator {
                config.load_generator.enabled = false;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let deps = match RunDeps::from_config(&config) {
        Ok(d) => d,
        Err(e) => {
            error!("Failed to set up run: {e}");
            return ExitCode::FAILURE;
        }
    };

    let results_dir = PathBuf::from(&config.output.results_dir);
    let telemetry_config = config.telemetry.clone();

    let orchestrator = match Orchestrator::new(config, deps) {
        Ok(o) => o,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if telemetry_config.exporter_enabled {
        if let Err(e) = telemetry::install_exporter(telemetry_config.exporter_listen) {
            warn!("Metrics exporter unavailable: {e}");
        }
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        test_id = orchestrator.test_id(),
        "Starting Chaos Gate"
    );

    let summary = orchestrator.run(shutdown_signal()).await;

    print!("{}", summary.render());
    let written = match summary.write_to(&results_dir) {
        Ok(path) => {
            println!("Summary: {}", path.display());
            true
        }
        Err(e) => {
            error!("Failed to write run summary: {e}");
            false
        }
    };

    if !summary.cleanup_succeeded() {
        return ExitCode::from(EXIT_CLEANUP_FAILED);
    }
    if written {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
