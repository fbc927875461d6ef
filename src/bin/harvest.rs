//! harvest CLI: run pipeline roles and poke at the work queue.

use harvest::config::{Config, PipelineConfig};
use harvest::db::Db;
use harvest::engine::{FetchPool, OperationRegistry, PersistPool, Scheduler, TopicRegistry};
use harvest::engine::triggers;
use harvest::model::{OperationKind, Priority, Work};
use harvest::services::Services;
use harvest::shutdown::{self, Shutdown, ShutdownTrigger};
use harvest::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "harvest", about = "Harvest the game API into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trigger scheduler
    Scheduler,
    /// Run the fetch worker pool
    Fetcher {
        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Run the persistence worker pool
    Persister,
    /// Run scheduler, fetcher and persister in one process
    All,
    /// Work queue operations
    Work {
        #[command(subcommand)]
        action: WorkAction,
    },
    /// Queue inspection
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Apply database migrations and create the bus topics
    Migrate,
}

#[derive(Subcommand)]
enum WorkAction {
    /// Enqueue one work item
    Enqueue {
        /// Operation tag, e.g. "character"
        operation: String,
        /// JSON parameter, e.g. 95465499 or '["abc123", 56271]'
        parameter: String,
        /// low, normal, high or urgent
        #[arg(long, default_value = "normal")]
        priority: String,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Print the number of pending work items
    Size,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let mut pipeline = config.pipeline()?;

    match cli.command {
        Command::Scheduler => {
            let _guard = telemetry(&config, "harvest-scheduler")?;
            let services = connect(&config, &pipeline).await?;
            let (trigger, shutdown) = shutdown::channel();
            spawn_signal_handler(trigger);
            run_scheduler(services, shutdown).await
        }
        Command::Fetcher { workers } => {
            if let Some(workers) = workers {
                pipeline.fetch.workers = workers;
            }
            let _guard = telemetry(&config, "harvest-fetcher")?;
            let services = connect(&config, &pipeline).await?;
            let (trigger, shutdown) = shutdown::channel();
            spawn_signal_handler(trigger);
            run_fetcher(services, shutdown).await
        }
        Command::Persister => {
            let _guard = telemetry(&config, "harvest-persister")?;
            let services = connect(&config, &pipeline).await?;
            let (trigger, shutdown) = shutdown::channel();
            spawn_signal_handler(trigger);
            run_persister(services, &pipeline, shutdown).await
        }
        Command::All => {
            let _guard = telemetry(&config, "harvest")?;
            let services = connect(&config, &pipeline).await?;
            let (trigger, shutdown) = shutdown::channel();
            spawn_signal_handler(trigger);
            let (scheduled, fetched, persisted) = tokio::join!(
                run_scheduler(services.clone(), shutdown.clone()),
                run_fetcher(services.clone(), shutdown.clone()),
                run_persister(services, &pipeline, shutdown),
            );
            scheduled?;
            fetched?;
            persisted?;
            Ok(())
        }
        Command::Work {
            action:
                WorkAction::Enqueue {
                    operation,
                    parameter,
                    priority,
                },
        } => {
            let services = connect(&config, &pipeline).await?;
            let operation: OperationKind = operation.parse()?;
            let priority: Priority = priority.parse()?;
            let parameter: serde_json::Value = serde_json::from_str(&parameter)?;
            services
                .queue
                .enqueue_one(Work::new(operation, parameter), priority)
                .await?;
            println!("Enqueued {operation} at {priority}");
            Ok(())
        }
        Command::Queue {
            action: QueueAction::Size,
        } => {
            let services = connect(&config, &pipeline).await?;
            println!("{}", services.queue.size().await?);
            Ok(())
        }
        Command::Migrate => {
            let db = Db::connect(
                config.database_url.expose_secret(),
                pipeline.database.max_connections,
            )
            .await?;
            db.migrate().await?;
            harvest::bus::Bus::ensure_topics(&db).await?;
            println!("Migrations applied");
            Ok(())
        }
    }
}

fn telemetry(config: &Config, service_name: &str) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: service_name.to_string(),
        log_level: config.log_level.clone(),
        json: config.log_json,
    })?)
}

async fn connect(config: &Config, pipeline: &PipelineConfig) -> anyhow::Result<Services> {
    let db = Db::connect(
        config.database_url.expose_secret(),
        pipeline.database.max_connections,
    )
    .await?;
    db.migrate().await?;
    Ok(Services::production(config, pipeline, Arc::new(db))?)
}

/// Trip the stop signal on Ctrl+C or SIGTERM.
fn spawn_signal_handler(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.ok();
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
        tracing::info!("shutdown requested, draining in-flight work");
        trigger.trigger();
    });
}

async fn run_scheduler(services: Services, shutdown: Shutdown) -> anyhow::Result<()> {
    let config = services.scheduler.clone();
    let mut scheduler = Scheduler::new(services);
    triggers::register_standard(&mut scheduler, &config)?;
    Arc::new(scheduler).run(shutdown).await?;
    Ok(())
}

async fn run_fetcher(services: Services, shutdown: Shutdown) -> anyhow::Result<()> {
    let pool = FetchPool::new(services, OperationRegistry::standard()?)?;
    Arc::new(pool).run(shutdown).await?;
    Ok(())
}

async fn run_persister(
    services: Services,
    pipeline: &PipelineConfig,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let pool = PersistPool::new(
        services.bus,
        services.store,
        TopicRegistry::standard()?,
        pipeline.persist.clone(),
    )?;
    Arc::new(pool).run(shutdown).await?;
    Ok(())
}
