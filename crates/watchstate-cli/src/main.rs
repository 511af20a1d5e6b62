use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod logging;
mod output;

use commands::{backend, db, serve, state, system};

/// Exit codes shared by every verb.
pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_BACKEND: u8 = 3;

#[derive(Parser)]
#[command(name = "watchstate")]
#[command(about = "Synchronize play state across Plex, Jellyfin and Emby backends")]
#[command(version)]
struct Cli {
    /// Enable verbose output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output format for summaries
    #[arg(long, global = true, default_value = "human", value_enum)]
    output: output::OutputFormat,

    /// Override the config directory (default: WS_CONFIG_DIR or platform config dir)
    #[arg(long, global = true, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play-state sync operations
    State {
        #[command(subcommand)]
        cmd: state::StateCommands,
    },
    /// Inspect and maintain the local state database
    Db {
        #[command(subcommand)]
        cmd: db::DbCommands,
    },
    /// Per-backend library diagnostics
    Backend {
        #[command(subcommand)]
        cmd: backend::BackendCommands,
    },
    /// Instance-level helpers
    System {
        #[command(subcommand)]
        cmd: system::SystemCommands,
    },
    /// Run the scheduler loop (cron-driven sync + webhook drainer)
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let output = output::Output::new(cli.output, cli.quiet);

    let log_dir = match &cli.command {
        Commands::Serve => {
            let paths = commands::path_manager(cli.config_dir.clone());
            Some(paths.log_dir())
        }
        _ => None,
    };
    if let Err(e) = logging::init(cli.verbose, cli.quiet, log_dir.as_deref()) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(EXIT_FAILURE);
    }

    let code = match run(cli, &output).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            EXIT_FAILURE
        }
    };
    ExitCode::from(code)
}

async fn run(cli: Cli, output: &output::Output) -> anyhow::Result<u8> {
    match cli.command {
        Commands::State { cmd } => state::run(cmd, cli.config_dir, output).await,
        Commands::Db { cmd } => db::run(cmd, cli.config_dir, output).await,
        Commands::Backend { cmd } => backend::run(cmd, cli.config_dir, output).await,
        Commands::System { cmd } => system::run(cmd, cli.config_dir, output).await,
        Commands::Serve => serve::run(cli.config_dir, output).await,
    }
}
