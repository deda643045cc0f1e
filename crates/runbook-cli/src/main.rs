//! Runbook CLI - drive the cell coordination engine against an in-memory runner.

mod simulate;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use runbook_core::{CoordinatorConfig, TerminalKind};

use simulate::SimulateOptions;

#[derive(Parser)]
#[command(name = "runbook")]
#[command(about = "Cell execution and output coordination for Runbook notebooks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run cells against an in-memory runner and print a JSON report
    Simulate {
        /// Number of cells to register
        #[arg(long, default_value = "2")]
        cells: u64,

        /// Executions per cell
        #[arg(long, default_value = "3")]
        runs: usize,

        /// Session the runner starts in
        #[arg(long, default_value = "session-1")]
        session: String,

        /// Reconnect to this session halfway through
        #[arg(long)]
        reconnect: Option<String>,

        /// Attach a terminal of this kind to every cell
        #[arg(long, value_enum)]
        terminal: Option<TerminalArg>,

        /// Start with no runner attached
        #[arg(long)]
        offline: bool,

        /// Decline the runner selection prompt
        #[arg(long)]
        decline: bool,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum TerminalArg {
    Interactive,
    Local,
}

impl From<TerminalArg> for TerminalKind {
    fn from(arg: TerminalArg) -> Self {
        match arg {
            TerminalArg::Interactive => TerminalKind::Interactive,
            TerminalArg::Local => TerminalKind::Local,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Helper to format runbook-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(runbook_err) = err.downcast_ref::<runbook_core::Error>() {
            anyhow::anyhow!("{}", runbook_err.with_hint())
        } else {
            err
        }
    };

    let config = load_config(cli.config.as_deref()).map_err(format_error)?;

    match cli.command {
        Commands::Simulate {
            cells,
            runs,
            session,
            reconnect,
            terminal,
            offline,
            decline,
        } => {
            let options = SimulateOptions {
                cells,
                runs,
                session,
                reconnect,
                terminal: terminal.map(TerminalKind::from),
                offline,
                decline,
            };
            simulate::execute(config, options).await.map_err(format_error)?;
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Load configuration from `path`, or fall back to defaults.
fn load_config(path: Option<&Path>) -> anyhow::Result<CoordinatorConfig> {
    match path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Loading configuration");
            CoordinatorConfig::from_file(path)
                .with_context(|| format!("failed to load configuration from {}", path.display()))
        }
        None => Ok(CoordinatorConfig::default()),
    }
}
