//! Model Trainer CLI
//!
//! `mtrain` runs the queue worker and the maintenance jobs (cache,
//! tokenizer and artifact cleanup), and inspects or cancels training runs
//! through the shared state store.

mod commands;

use clap::{Parser, Subcommand};
use model_trainer_core::Settings;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::{cleanup, run, worker};

/// Model Trainer maintenance and run control
#[derive(Parser, Debug)]
#[command(name = "mtrain", author, version, about = "Model Trainer maintenance and run control")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Path to the TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reclaim disk space held by caches and finished runs
    #[command(subcommand)]
    Cleanup(CleanupCommand),

    /// Show the status of a training run
    Status {
        /// Run identifier
        #[arg(long)]
        run_id: String,
    },

    /// Request cancellation of a training run
    Cancel {
        /// Run identifier
        #[arg(long)]
        run_id: String,
    },

    /// Execute queued jobs until interrupted with Ctrl-C
    Worker {
        /// Pause between polls of an empty queue, in milliseconds
        #[arg(long, default_value_t = 1000)]
        idle_ms: u64,
    },
}

#[derive(Subcommand, Debug)]
enum CleanupCommand {
    /// Evict cached corpus files until size and free-space limits hold
    CorpusCache,

    /// Delete old tokenizers that no run manifest references
    Tokenizers,

    /// Delete the local artifacts of a finished, uploaded run
    Artifacts {
        /// Run identifier
        #[arg(long)]
        run_id: String,
    },
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // RUST_LOG wins over --log-level when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let settings = Settings::load(args.config.as_deref())?;
    tracing::debug!(config = ?args.config, artifacts_root = %settings.app.artifacts_root.display(), "settings loaded");

    let output = match args.command {
        Command::Cleanup(CleanupCommand::CorpusCache) => cleanup::corpus_cache(&settings)?,
        Command::Cleanup(CleanupCommand::Tokenizers) => cleanup::tokenizers(&settings)?,
        Command::Cleanup(CleanupCommand::Artifacts { run_id }) => {
            cleanup::artifacts(&settings, &run_id).await?
        }
        Command::Status { run_id } => run::status(&settings, &run_id).await?,
        Command::Cancel { run_id } => run::cancel(&settings, &run_id).await?,
        Command::Worker { idle_ms } => worker::run(&settings, idle_ms).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
