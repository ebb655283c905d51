use anyhow::Context;
use clap::{Parser, Subcommand};
use cinejobs_core::config::{CineJobsConfig, StorageMode};
use cinejobs_email::service::{register_definitions, register_payloads, sender_from_config};
use cinejobs_email::JobSchedulerService;
use cinejobs_scheduler::{
    Database, ExecutionStatus, HistoryFilter, JobRegistry, RetryPolicy, Scheduler,
    SchedulerSettings, TriggerFilter, TriggerId, TriggerState,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cinejobs-worker", version, about = "CineSocial background job worker")]
struct Cli {
    /// Config file (default: $CINEJOBS_CONFIG, then ~/.cinejobs/cinejobs.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a scheduler node until Ctrl-C.
    Run,
    /// Queue an email verification.
    ScheduleVerification {
        #[arg(long)]
        email: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        token: String,
    },
    /// Show execution history, newest first.
    History {
        #[arg(long)]
        job_name: Option<String>,
        #[arg(long)]
        job_group: Option<String>,
        /// running | success | failed_will_retry | failed | cancelled
        #[arg(long)]
        status: Option<ExecutionStatus>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// List scheduled triggers.
    Triggers {
        /// waiting | acquired | blocked | paused | complete | error
        #[arg(long)]
        state: Option<TriggerState>,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// Delete a trigger that has not fired yet.
    Cancel { trigger_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cinejobs_worker=info,cinejobs_scheduler=info,cinejobs_email=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // explicit flag > CINEJOBS_CONFIG > ~/.cinejobs/cinejobs.toml
    let config_path = cli.config.or_else(|| std::env::var("CINEJOBS_CONFIG").ok());
    let config = CineJobsConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        CineJobsConfig::default()
    });

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::ScheduleVerification {
            email,
            username,
            token,
        } => {
            let scheduler = operator_node(&config)?;
            let id = scheduler.schedule_email_verification(&email, &username, &token)?;
            println!("{id}");
            scheduler.stop().await;
            Ok(())
        }
        Command::History {
            job_name,
            job_group,
            status,
            limit,
        } => {
            let scheduler = operator_node(&config)?;
            let records = scheduler.history().query(&HistoryFilter {
                job_name,
                job_group,
                status,
                limit: Some(limit),
                ..HistoryFilter::default()
            })?;
            for r in records {
                println!(
                    "{}  {:<18} {}.{}  retry {}/{}  {}ms  {}",
                    r.started_at.format("%Y-%m-%d %H:%M:%S"),
                    r.status,
                    r.job_group,
                    r.job_name,
                    r.retry_count,
                    r.max_retries,
                    r.duration_ms.map_or_else(|| "-".to_string(), |d| d.to_string()),
                    r.error_message.unwrap_or_default(),
                );
            }
            scheduler.stop().await;
            Ok(())
        }
        Command::Triggers { state, limit } => {
            let scheduler = operator_node(&config)?;
            let triggers = scheduler.list_triggers(&TriggerFilter {
                state,
                limit: Some(limit),
                ..TriggerFilter::default()
            })?;
            for t in triggers {
                println!(
                    "{}  {:<8} {}.{}  next {}  retry {}/{}",
                    t.trigger_id,
                    t.state,
                    t.job_group,
                    t.job_name,
                    t.next_fire_time
                        .map_or_else(|| "-".to_string(), |at| at.to_rfc3339()),
                    t.retry_count,
                    t.max_retries,
                );
            }
            scheduler.stop().await;
            Ok(())
        }
        Command::Cancel { trigger_id } => {
            let scheduler = operator_node(&config)?;
            let cancelled = scheduler.cancel_job(&TriggerId::from(trigger_id.as_str()))?;
            scheduler.stop().await;
            if !cancelled {
                anyhow::bail!("trigger {trigger_id} not found or already fired");
            }
            println!("cancelled {trigger_id}");
            Ok(())
        }
    }
}

async fn run(config: CineJobsConfig) -> anyhow::Result<()> {
    let sender = sender_from_config(&config.smtp).context("invalid SMTP configuration")?;
    let mut registry = JobRegistry::new();
    register_payloads(&mut registry, sender);

    ensure_store_dir(&config)?;
    let scheduler = Scheduler::from_config(&config, registry).context("job store unavailable")?;
    register_definitions(&scheduler, &config.retry)?;
    scheduler.start()?;
    info!(
        scheduler = %config.scheduler.instance_name,
        node_id = %scheduler.node_id(),
        "worker running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    scheduler.stop().await;
    Ok(())
}

/// A short-lived node for operator commands. It never starts its loop and
/// uses its own node id so it cannot disturb a running worker's claims.
fn operator_node(config: &CineJobsConfig) -> anyhow::Result<Scheduler> {
    ensure_store_dir(config)?;
    let db = Database::open(config.scheduler.storage, &config.database.path)
        .context("job store unavailable")?;
    let settings = SchedulerSettings {
        node_id: format!("cli-{}", uuid::Uuid::now_v7().simple()),
        ..SchedulerSettings::from_config(&config.scheduler)
    };
    let scheduler = Scheduler::connect(
        &db,
        settings,
        JobRegistry::new(),
        RetryPolicy::from_config(&config.retry),
    )?;
    register_definitions(&scheduler, &config.retry)?;
    Ok(scheduler)
}

fn ensure_store_dir(config: &CineJobsConfig) -> cinejobs_core::Result<()> {
    if config.scheduler.storage != StorageMode::Persistent {
        return Ok(());
    }
    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
