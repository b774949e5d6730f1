//! Cadence: lock-guarded recurring job scheduler
//!
//! Main binary with subcommands:
//! - `run`: schedule engine and queue worker in one process
//! - `scheduler` / `worker`: either loop on its own
//! - `schedules`: configured schedules and their next occurrence
//! - `migrate`: schema migrations
//! - `failed`: inspect and redeliver dead-lettered messages

use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadence_scheduler::{RunStateStore, SqliteRunStateStore};

mod config;
mod daemon;
mod failed;
mod migrate;

use config::Config;
use daemon::{Role, Services};
use failed::FailedAction;
use migrate::MigrateAction;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Lock-guarded recurring job scheduler", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "CADENCE_CONFIG", default_value = "cadence.toml")]
    config: PathBuf,

    /// SQLite database shared by every scheduler and worker process
    #[arg(long, global = true, env = "CADENCE_DATABASE", default_value = "cadence.db")]
    database: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the schedule engine and a queue worker
    Run,

    /// Run only the schedule engine
    Scheduler,

    /// Run only a queue worker
    Worker,

    /// List schedules with their last claim and next occurrence
    Schedules {
        /// Forget the last claim of a schedule
        #[arg(long, value_name = "KEY")]
        reset: Option<String>,
    },

    /// Manage database migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateCommand,
    },

    /// Inspect and redeliver failed messages
    Failed {
        #[command(subcommand)]
        action: FailedCommand,
    },
}

#[derive(Subcommand)]
enum MigrateCommand {
    /// Apply all pending migrations
    Up,
    /// Revert a migration (the most recent one by default)
    Down {
        #[arg(value_name = "VERSION")]
        version: Option<String>,
    },
    /// Show applied and pending migrations
    Status,
}

#[derive(Subcommand)]
enum FailedCommand {
    /// List failed messages
    List {
        /// Only messages from this queue
        #[arg(long)]
        queue: Option<String>,

        /// Include messages that were already redelivered
        #[arg(long)]
        all: bool,

        /// Maximum number of messages to show
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show one failed message
    Show { id: u64 },
    /// Handle a failed message inline now
    Replay { id: u64 },
    /// Send a failed message back to its queue
    Requeue { id: u64 },
}

impl From<MigrateCommand> for MigrateAction {
    fn from(command: MigrateCommand) -> Self {
        match command {
            MigrateCommand::Up => MigrateAction::Up,
            MigrateCommand::Down { version } => MigrateAction::Down { version },
            MigrateCommand::Status => MigrateAction::Status,
        }
    }
}

impl From<FailedCommand> for FailedAction {
    fn from(command: FailedCommand) -> Self {
        match command {
            FailedCommand::List { queue, all, limit } => FailedAction::List { queue, all, limit },
            FailedCommand::Show { id } => FailedAction::Show { id },
            FailedCommand::Replay { id } => FailedAction::Replay { id },
            FailedCommand::Requeue { id } => FailedAction::Requeue { id },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cadence=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => daemon::run(Config::load(&cli.config)?, &cli.database, Role::All).await,
        Commands::Scheduler => {
            daemon::run(Config::load(&cli.config)?, &cli.database, Role::Scheduler).await
        }
        Commands::Worker => {
            daemon::run(Config::load(&cli.config)?, &cli.database, Role::Worker).await
        }
        Commands::Schedules { reset } => {
            list_schedules(Config::load(&cli.config)?, &cli.database, reset.as_deref()).await
        }
        Commands::Migrate { action } => migrate::run(&cli.database, action.into()),
        Commands::Failed { action } => {
            let services = Services::open(Config::load(&cli.config)?, &cli.database)?;
            failed::run(&services, action.into()).await
        }
    }
}

async fn list_schedules(config: Config, database: &Path, reset: Option<&str>) -> Result<()> {
    if let Some(key) = reset {
        let run_state =
            SqliteRunStateStore::open(database).map_err(|e| miette::miette!("{}", e))?;
        run_state
            .reset(key)
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        println!("Reset last claim of {}", key);
    }

    let services = Services::open(config, database)?;
    let engine = services.engine(database)?;
    let upcoming = engine
        .upcoming(Utc::now())
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    if upcoming.is_empty() {
        println!("No schedules configured.");
        return Ok(());
    }

    println!("Schedules:\n");
    for run in upcoming {
        let last = run
            .last_claimed_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        let next = run
            .next_occurrence
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "none".to_string());
        println!("  {} ({}) -> {}", run.schedule_key, run.cron, run.message_kind);
        println!("      last claimed: {}", last);
        println!("      next:         {}\n", next);
    }

    Ok(())
}
