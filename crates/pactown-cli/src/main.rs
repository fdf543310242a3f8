//! pactown - service ecosystem orchestrator.
//!
//! CLI front-end for the orchestration engine: start, stop, and inspect an
//! ecosystem described by a YAML configuration.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// pactown - service ecosystem orchestrator
#[derive(Parser, Debug)]
#[command(name = "pactown")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start all services and stay resident until Ctrl-C
    Up {
        /// Path to the ecosystem configuration file
        config: PathBuf,
    },

    /// Stop all services
    Down {
        /// Path to the ecosystem configuration file
        config: PathBuf,
    },

    /// Show status of all services
    Status {
        /// Path to the ecosystem configuration file
        config: PathBuf,
    },

    /// Validate the ecosystem configuration
    Validate {
        /// Path to the ecosystem configuration file
        config: PathBuf,
    },

    /// Show the dependency graph
    Graph {
        /// Path to the ecosystem configuration file
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let result = match cli.command {
        Commands::Up { config } => commands::ecosystem::up(&config).await,
        Commands::Down { config } => commands::ecosystem::down(&config).await,
        Commands::Status { config } => commands::ecosystem::status(&config).await,
        Commands::Validate { config } => commands::ecosystem::validate(&config),
        Commands::Graph { config } => commands::ecosystem::graph(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            let code = u8::try_from(e.exit_code()).unwrap_or(1);
            ExitCode::from(code)
        },
    }
}
