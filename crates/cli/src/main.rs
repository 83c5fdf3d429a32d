//! dirwatch CLI - dw command

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cmd;
mod config;
mod util;

/// dirwatch - directory listing, sizing and change notification
#[derive(Parser)]
#[command(name = "dw")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the entries of a directory
    Ls {
        /// Directory to list
        path: PathBuf,
        /// Include "." and ".."
        #[arg(short, long)]
        all: bool,
        /// Refuse a symlink given as the directory
        #[arg(long)]
        no_follow: bool,
    },
    /// Total the sizes of everything under a path
    Du {
        /// Root of the walk
        path: PathBuf,
        /// Resolve a symlink given as the root
        #[arg(short = 'L', long)]
        dereference: bool,
        /// Stop after this many objects
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Print changes to a directory until Ctrl-C
    Watch {
        /// Directory to observe
        path: PathBuf,
        /// Refuse a symlink given as the directory
        #[arg(long)]
        no_follow: bool,
    },
    /// Show the effective configuration
    Config {
        /// Only print the config file location
        #[arg(long)]
        path: bool,
        /// Print an annotated example file
        #[arg(long)]
        example: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::load()?;
    let _log_guard = init_tracing(&config)?;

    match cli.command {
        Commands::Ls { path, all, no_follow } => cmd::ls::run(&path, all, no_follow).await,
        Commands::Du { path, dereference, limit } => {
            let dereference = dereference || config.walk.follow_root_symlink;
            cmd::du::run(&path, dereference, limit).await
        }
        Commands::Watch { path, no_follow } => cmd::watch::run(&path, no_follow, &config).await,
        Commands::Config { path, example } => cmd::config::run(&config, path, example).await,
    }
}

/// Log to stderr, and to the configured file if any
///
/// The returned guard flushes the file writer when dropped.
fn init_tracing(config: &config::Config) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let Some(log_file) = &config.logging.log_file else {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return Ok(None);
    };

    let dir = log_file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let name = log_file
        .file_name()
        .with_context(|| format!("Invalid log_file {}", log_file.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(
            fmt::layer()
                .with_thread_ids(true)
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
    Ok(Some(guard))
}
