//! pipewright - workflow pipeline engine
//!
//! Main entry point for the pipewright service.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use pipewright_config::{CONFIG_ENV, LoadedConfig};

mod commands;

use commands::{config, migrate, serve};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// pipewright - workflow pipeline engine
#[derive(Parser)]
#[command(name = "pipewright")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the YAML configuration file
    #[arg(short, long, global = true, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API, bus consumers and background sweeps
    Serve(serve::ServeArgs),

    /// Create or upgrade the database schema and exit
    Migrate,

    /// Configuration inspection
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = pipewright_config::load_config(cli.config.as_deref())?;
    let _guard = init_tracing(&cli, &loaded);

    let ctx = commands::Context {
        loaded,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Serve(args) => serve::run(args, &ctx).await,
        Commands::Migrate => migrate::run(&ctx),
        Commands::Config(args) => config::run(args, &ctx),
    }
}

/// Console (human-readable) plus a daily rolling JSON file.
fn init_tracing(cli: &Cli, loaded: &LoadedConfig) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::prelude::*;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        loaded
            .config
            .log_level
            .clone()
            .unwrap_or_else(|| "info".to_string())
    };
    let console_filter = format!(
        "pipewright={level},pipewright_engine={level},pipewright_server={level},\
         pipewright_bus={level},pipewright_store={level},pipewright_sla={level},\
         pipewright_delegation={level},pipewright_config={level},warn"
    );

    let log_dir = loaded
        .config
        .engine
        .log_dir
        .clone()
        .unwrap_or_else(|| pipewright_config::data_dir().join("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "pipewright.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(tracing_subscriber::EnvFilter::new(console_filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "pipewright=debug,pipewright_engine=debug,pipewright_server=debug,\
                     pipewright_bus=debug,pipewright_store=debug,info",
                )),
        )
        .init();

    guard
}
