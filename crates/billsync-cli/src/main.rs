use std::sync::Arc;

use anyhow::{Context, Result};
use billsync_core::JobStatus;
use billsync_sync::{
    maybe_build_scheduler, JobController, JobError, MemorySyncStore, PgSyncStore, SyncConfig,
    SyncEngine,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "billsync")]
#[command(about = "Legislative bill history sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Create a PENDING job covering every enabled bill type.
    Create,
    Start { id: Uuid },
    Pause { id: Uuid },
    Resume { id: Uuid },
    Stop { id: Uuid },
    /// Run one batch of a RUNNING job.
    Process { id: Uuid },
    /// Show a job, or the active job when no id is given.
    Status { id: Option<Uuid> },
    /// Create or resume a job and process it until it leaves RUNNING.
    Run {
        /// Keep jobs and bills in memory instead of the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Advance the running job on the configured cron schedule until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            let store = PgSyncStore::connect(&config.database_url).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Create => {
            let engine = SyncEngine::connect(config).await?;
            let plan = engine.resolve_plan().await?;
            print_json(&engine.controller(plan).create().await?)?;
        }
        Commands::Start { id } => print_json(&controller(config).await?.start(id).await?)?,
        Commands::Pause { id } => print_json(&controller(config).await?.pause(id).await?)?,
        Commands::Resume { id } => print_json(&controller(config).await?.resume(id).await?)?,
        Commands::Stop { id } => print_json(&controller(config).await?.stop(id).await?)?,
        Commands::Process { id } => print_json(&controller(config).await?.process(id).await?)?,
        Commands::Status { id } => {
            let jobs = controller(config).await?;
            match id {
                Some(id) => print_json(&jobs.get(id).await?)?,
                None => print_json(&jobs.get_active().await?)?,
            }
        }
        Commands::Run { dry_run } => {
            let engine = if dry_run {
                SyncEngine::load(config, Arc::new(MemorySyncStore::new()))?
            } else {
                SyncEngine::connect(config).await?
            };
            let plan = engine.resolve_plan().await?;
            let jobs = engine.controller(plan);
            let job = match jobs.create().await {
                Ok(job) => job,
                Err(JobError::Conflict { existing, .. }) => {
                    info!(job_id = %existing, "continuing existing sync job");
                    jobs.get(existing).await?
                }
                Err(err) => return Err(err.into()),
            };
            if job.status != JobStatus::Running {
                jobs.start(job.id).await?;
            }
            print_json(&jobs.run_until_idle(job.id).await?)?;
        }
        Commands::Schedule => {
            let engine = SyncEngine::connect(config.clone()).await?;
            let jobs = Arc::new(engine.controller(Vec::new()));
            let Some(mut sched) = maybe_build_scheduler(&config, jobs).await? else {
                anyhow::bail!("scheduler disabled; set BILLSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn controller(config: SyncConfig) -> Result<JobController> {
    Ok(SyncEngine::connect(config).await?.controller(Vec::new()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "billsync={level},billsync_sync={level},billsync_adapters={level},billsync_storage={level}"
        ))
    });

    match cli.log_format {
        LogFormat::Text => fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}
